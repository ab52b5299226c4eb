#![allow(unsafe_code)]

//! Memory-mapped weight file.
//!
//! One fixed-size slot per goff behind a 64-byte header. The file only ever
//! grows, in chunks, under the exclusive side of `growth`. Slot accessors take
//! the shared side just long enough to clone the current [`Mapping`] handle and
//! release it before locking the slot's shard, so the growth lock and a shard
//! lock are never held together.
//!
//! A mapping retired by growth stays valid until its last handle drops. Old
//! and new mappings are shared views of the same file, so a write through
//! either is visible through both.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use memmap2::MmapRaw;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::primitives::concurrency::ShardLocks;
use crate::types::{DagError, Goff, Hash, Result, Weight};

/// Bytes per goff slot.
pub const SLOT_LEN: usize = 32;
/// Bytes reserved for the file header.
pub const HEADER_LEN: usize = 64;
/// Slots added per growth step unless configured otherwise.
pub const DEFAULT_GROWTH_CHUNK_SLOTS: u64 = 32_768;

const MAGIC: [u8; 4] = *b"DAGW";
const FORMAT_VERSION: u16 = 1;
const FLAG_PENDING: u8 = 0b0000_0001;

mod header {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const SLOT_LEN: Range<usize> = 8..12;
    pub const CRC32: Range<usize> = 60..64;
}

mod slot {
    use core::ops::Range;

    pub const WEIGHT: Range<usize> = 0..16;
    pub const BACK_REF: Range<usize> = 16..24;
    pub const FLAGS: usize = 24;
}

/// Decoded contents of one weight slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Slot {
    /// Cumulative weight.
    pub weight: Weight,
    /// Hash prefix of the owning record; zero when unassigned.
    pub back_ref: u64,
    /// Weight application still outstanding.
    pub pending: bool,
}

impl Slot {
    /// Whether a record has been admitted into this slot.
    pub fn is_assigned(&self) -> bool {
        self.back_ref != 0
    }

    /// Whether the slot belongs to the record with `hash`.
    pub fn belongs_to(&self, hash: &Hash) -> bool {
        self.back_ref == hash.back_ref()
    }

    fn decode(buf: &[u8; SLOT_LEN]) -> Self {
        let mut weight = [0u8; 16];
        weight.copy_from_slice(&buf[slot::WEIGHT]);
        let mut back_ref = [0u8; 8];
        back_ref.copy_from_slice(&buf[slot::BACK_REF]);
        Self {
            weight: Weight::from_le_bytes(weight),
            back_ref: u64::from_le_bytes(back_ref),
            pending: buf[slot::FLAGS] & FLAG_PENDING != 0,
        }
    }

    fn encode(&self) -> [u8; SLOT_LEN] {
        let mut buf = [0u8; SLOT_LEN];
        buf[slot::WEIGHT].copy_from_slice(&self.weight.to_le_bytes());
        buf[slot::BACK_REF].copy_from_slice(&self.back_ref.to_le_bytes());
        if self.pending {
            buf[slot::FLAGS] |= FLAG_PENDING;
        }
        buf
    }
}

/// One mapped view of the file, `capacity` slots long.
struct Mapping {
    map: MmapRaw,
    capacity: u64,
}

struct Growth {
    file: File,
    current: Arc<Mapping>,
}

impl Mapping {
    fn read(&self, goff: Goff) -> Option<Slot> {
        if goff.0 >= self.capacity {
            return None;
        }
        let mut buf = [0u8; SLOT_LEN];
        // SAFETY: goff < capacity, so the slot lies inside this mapping, which
        // is never unmapped while a handle to it exists. The caller holds the
        // slot's shard lock.
        unsafe {
            ptr::copy_nonoverlapping(
                self.map.as_ptr().add(slot_offset(goff)),
                buf.as_mut_ptr(),
                SLOT_LEN,
            );
        }
        Some(Slot::decode(&buf))
    }

    fn write(&self, goff: Goff, value: &Slot) -> Result<()> {
        if goff.0 >= self.capacity {
            return Err(DagError::Inconsistency(format!(
                "goff {goff} beyond weight file capacity {}",
                self.capacity
            )));
        }
        let buf = value.encode();
        // SAFETY: bounds checked above and the mapping lives as long as `self`;
        // writers to one slot are serialised by its shard lock.
        unsafe {
            ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.map.as_mut_ptr().add(slot_offset(goff)),
                SLOT_LEN,
            );
        }
        Ok(())
    }
}

fn slot_offset(goff: Goff) -> usize {
    HEADER_LEN + goff.0 as usize * SLOT_LEN
}

fn file_len_for(capacity: u64) -> u64 {
    HEADER_LEN as u64 + capacity * SLOT_LEN as u64
}

/// Append-grown array of weight slots indexed by goff.
pub struct GraphFile {
    path: PathBuf,
    chunk_slots: u64,
    max_slots: Option<u64>,
    locks: ShardLocks,
    growth: RwLock<Growth>,
}

impl GraphFile {
    /// Opens or creates the weight file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        chunk_slots: u64,
        max_slots: Option<u64>,
        locks: ShardLocks,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let chunk_slots = chunk_slots.max(1);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let capacity = if len == 0 {
            let capacity = match max_slots {
                Some(max) => chunk_slots.min(max),
                None => chunk_slots,
            };
            file.set_len(file_len_for(capacity))?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_header())?;
            file.sync_all()?;
            debug!(path = %path.display(), capacity, "graphfile.create");
            capacity
        } else {
            if len < HEADER_LEN as u64 || (len - HEADER_LEN as u64) % SLOT_LEN as u64 != 0 {
                return Err(DagError::Corruption("weight file length is not slot aligned"));
            }
            let mut buf = [0u8; HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            check_header(&buf)?;
            (len - HEADER_LEN as u64) / SLOT_LEN as u64
        };
        let map = MmapRaw::map_raw(&file)?;
        Ok(Self {
            path,
            chunk_slots,
            max_slots,
            locks,
            growth: RwLock::new(Growth {
                file,
                current: Arc::new(Mapping { map, capacity }),
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shard locks guarding slot mutation.
    pub fn locks(&self) -> &ShardLocks {
        &self.locks
    }

    /// Number of slots currently mapped.
    pub fn capacity(&self) -> u64 {
        self.growth.read().current.capacity
    }

    /// Handle to the current mapping; the growth lock is released on return.
    fn mapping(&self) -> Arc<Mapping> {
        Arc::clone(&self.growth.read().current)
    }

    /// Ensures a slot exists for `goff`, growing by whole chunks.
    ///
    /// Must not be called while holding a shard lock.
    pub fn grow_to(&self, goff: Goff) -> Result<()> {
        if goff.0 < self.capacity() {
            return Ok(());
        }
        let mut growth = self.growth.write();
        let old_capacity = growth.current.capacity;
        if goff.0 < old_capacity {
            return Ok(());
        }
        let needed = goff.0 + 1;
        let mut capacity = needed.div_ceil(self.chunk_slots) * self.chunk_slots;
        if let Some(max) = self.max_slots {
            if needed > max {
                return Err(DagError::Growth {
                    goff: goff.0,
                    source: io::Error::new(io::ErrorKind::Other, "weight file slot limit reached"),
                });
            }
            capacity = capacity.min(max);
        }
        let growth_err = |source: io::Error| DagError::Growth {
            goff: goff.0,
            source,
        };
        growth.current.map.flush().map_err(growth_err)?;
        growth
            .file
            .set_len(file_len_for(capacity))
            .map_err(growth_err)?;
        let map = MmapRaw::map_raw(&growth.file).map_err(growth_err)?;
        growth.current = Arc::new(Mapping { map, capacity });
        info!(goff = goff.0, old_capacity, capacity, "graphfile.grow");
        Ok(())
    }

    /// Snapshot of a slot, `None` beyond capacity.
    pub fn slot(&self, goff: Goff) -> Option<Slot> {
        let mapping = self.mapping();
        let _shard = self.locks.lock(goff);
        mapping.read(goff)
    }

    /// Current cumulative weight; zero for unassigned or unmapped slots.
    pub fn read_weight(&self, goff: Goff) -> Weight {
        self.slot(goff).map(|slot| slot.weight).unwrap_or(0)
    }

    /// Claims the slot for a newly admitted record: zero weight, pending.
    pub fn assign(&self, goff: Goff, hash: &Hash) -> Result<()> {
        let mapping = self.mapping();
        let _shard = self.locks.lock(goff);
        mapping.write(
            goff,
            &Slot {
                weight: 0,
                back_ref: hash.back_ref(),
                pending: true,
            },
        )
    }

    /// Updates the pending flag of an assigned slot.
    pub fn set_pending(&self, goff: Goff, pending: bool) -> Result<()> {
        let mapping = self.mapping();
        let _shard = self.locks.lock(goff);
        let mut current = mapping.read(goff).ok_or_else(|| unmapped(goff))?;
        current.pending = pending;
        mapping.write(goff, &current)
    }

    /// Saturating add of `delta` to the weight at `goff`.
    pub fn add_weight(&self, goff: Goff, delta: Weight) -> Result<Weight> {
        let mapping = self.mapping();
        let _shard = self.locks.lock(goff);
        add_locked(&mapping, goff, delta)
    }

    /// Applies every `(goff, delta)` pair while holding all of their shards.
    ///
    /// Every goff is checked before anything is written, so an unmapped goff
    /// leaves all slots untouched.
    pub fn add_weights(&self, deltas: &[(Goff, Weight)]) -> Result<()> {
        let mapping = self.mapping();
        let goffs: Vec<Goff> = deltas.iter().map(|(goff, _)| *goff).collect();
        let _shards = self.locks.lock_set(&goffs);
        if let Some(goff) = goffs.iter().find(|goff| goff.0 >= mapping.capacity) {
            return Err(unmapped(*goff));
        }
        for (goff, delta) in deltas {
            add_locked(&mapping, *goff, *delta)?;
        }
        Ok(())
    }

    /// Zeroes the weight of every assigned slot up to `through` and marks it
    /// pending again; used when weights are rebuilt from metadata.
    pub fn reset_weights(&self, through: Goff) -> Result<u64> {
        let mapping = self.mapping();
        let end = through.0.min(mapping.capacity.saturating_sub(1));
        let mut reset = 0;
        for goff in (0..=end).map(Goff) {
            let _shard = self.locks.lock(goff);
            if let Some(mut current) = mapping.read(goff) {
                if current.is_assigned() {
                    current.weight = 0;
                    current.pending = true;
                    mapping.write(goff, &current)?;
                    reset += 1;
                }
            }
        }
        mapping.map.flush()?;
        Ok(reset)
    }

    /// Flushes dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mapping().map.flush()?;
        Ok(())
    }
}

impl Drop for GraphFile {
    fn drop(&mut self) {
        if let Err(_err) = self.growth.get_mut().current.map.flush() {
            #[cfg(debug_assertions)]
            eprintln!("failed to flush weight file {}: {:?}", self.path.display(), _err);
        }
    }
}

fn add_locked(mapping: &Mapping, goff: Goff, delta: Weight) -> Result<Weight> {
    let mut current = mapping.read(goff).ok_or_else(|| unmapped(goff))?;
    current.weight = current.weight.saturating_add(delta);
    mapping.write(goff, &current)?;
    Ok(current.weight)
}

fn unmapped(goff: Goff) -> DagError {
    DagError::Inconsistency(format!("goff {goff} has no weight slot"))
}

fn encode_header() -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[header::MAGIC].copy_from_slice(&MAGIC);
    buf[header::FORMAT_VERSION].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[header::SLOT_LEN].copy_from_slice(&(SLOT_LEN as u32).to_le_bytes());
    let crc = crc32fast::hash(&buf[..header::CRC32.start]);
    buf[header::CRC32].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn check_header(buf: &[u8; HEADER_LEN]) -> Result<()> {
    if buf[header::MAGIC] != MAGIC {
        return Err(DagError::Corruption("weight file magic mismatch"));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&buf[header::CRC32]);
    if u32::from_le_bytes(crc) != crc32fast::hash(&buf[..header::CRC32.start]) {
        return Err(DagError::Corruption("weight file header checksum mismatch"));
    }
    let mut version = [0u8; 2];
    version.copy_from_slice(&buf[header::FORMAT_VERSION]);
    if u16::from_le_bytes(version) != FORMAT_VERSION {
        return Err(DagError::Corruption("unsupported weight file version"));
    }
    let mut slot_len = [0u8; 4];
    slot_len.copy_from_slice(&buf[header::SLOT_LEN]);
    if u32::from_le_bytes(slot_len) as usize != SLOT_LEN {
        return Err(DagError::Corruption("weight file slot size mismatch"));
    }
    Ok(())
}
