#![forbid(unsafe_code)]

//! SQLite-backed metadata: records, links, pending flags and peers.
//!
//! Every public method takes the connection mutex for its own duration, so a
//! multi-row write commits or rolls back as one transaction.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::debug;

use crate::record::{Record, RecordSpec};
use crate::store::options::Synchronous;
use crate::store::tracker::{Hole, Tracker};
use crate::types::{DagError, Goff, GoffRange, Hash, Owner, RecordId, Result, Selector};

const SCHEMA_VERSION: &str = "1";
const KEY_SCHEMA_VERSION: &str = "schema_version";
const KEY_CLEAN_SHUTDOWN: &str = "clean_shutdown";

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    k TEXT PRIMARY KEY NOT NULL,
    v TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS record (
    goff INTEGER PRIMARY KEY NOT NULL,
    hash BLOB NOT NULL,
    id BLOB NOT NULL,
    owner BLOB NOT NULL,
    selector0 BLOB NOT NULL,
    selector1 BLOB,
    ts INTEGER NOT NULL,
    work INTEGER NOT NULL,
    size INTEGER NOT NULL,
    value BLOB NOT NULL,
    pending INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS record_hash ON record (hash);
CREATE INDEX IF NOT EXISTS record_id_ts ON record (id, ts, hash);
CREATE INDEX IF NOT EXISTS record_pending ON record (goff) WHERE pending = 1;

CREATE TABLE IF NOT EXISTS link (
    from_goff INTEGER NOT NULL,
    idx INTEGER NOT NULL,
    to_hash BLOB NOT NULL,
    PRIMARY KEY (from_goff, idx)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS link_to_hash ON link (to_hash);

CREATE TABLE IF NOT EXISTS dangling_link (
    hash BLOB NOT NULL,
    linking_goff INTEGER NOT NULL,
    PRIMARY KEY (hash, linking_goff)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS wanted (
    hash BLOB PRIMARY KEY NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    last_request_ms INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS hole (
    start_goff INTEGER NOT NULL,
    end_goff INTEGER NOT NULL,
    waiting_goff INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    retry_at_ms INTEGER,
    PRIMARY KEY (start_goff, end_goff, waiting_goff)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS hole_waiting ON hole (waiting_goff);
CREATE INDEX IF NOT EXISTS hole_retry ON hole (retry_at_ms) WHERE retry_at_ms IS NOT NULL;

CREATE TABLE IF NOT EXISTS peer (
    key_hash BLOB NOT NULL,
    address_type INTEGER NOT NULL,
    address BLOB NOT NULL,
    port INTEGER NOT NULL,
    first_connect_ms INTEGER NOT NULL,
    last_connect_ms INTEGER NOT NULL,
    PRIMARY KEY (key_hash, address_type, address, port)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS potential_peer (
    key_hash BLOB NOT NULL,
    address_type INTEGER NOT NULL,
    address BLOB NOT NULL,
    port INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (key_hash, address_type, address, port)
) WITHOUT ROWID;
"#;

const RECORD_COLUMNS: &str =
    "goff, hash, id, owner, selector0, selector1, ts, work, size, pending";

/// Stored metadata of one record, without its value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordMeta {
    /// Graph offset.
    pub goff: Goff,
    /// Content hash.
    pub hash: Hash,
    /// Logical key.
    pub id: RecordId,
    /// Owner public key.
    pub owner: Owner,
    /// Selector ids.
    pub selectors: Vec<Selector>,
    /// Timestamp in seconds.
    pub timestamp: u64,
    /// Proof-of-work value.
    pub work: u64,
    /// Approximate stored size.
    pub size: u64,
    /// Declared links in order.
    pub links: Vec<Hash>,
    /// Weight application outstanding.
    pub pending: bool,
}

/// Result of an admission attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was stored at `goff`. `released` lists earlier records that
    /// linked to it while it was missing.
    Stored {
        /// Goff assigned to the record.
        goff: Goff,
        /// Referrers whose dangling link this record resolved.
        released: Vec<Goff>,
    },
    /// A record with the same hash already exists.
    Duplicate {
        /// Goff of the existing record.
        goff: Goff,
    },
}

impl PutOutcome {
    /// Goff of the stored or pre-existing record.
    pub fn goff(&self) -> Goff {
        match self {
            PutOutcome::Stored { goff, .. } | PutOutcome::Duplicate { goff } => *goff,
        }
    }

    /// Whether the record was already present.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, PutOutcome::Duplicate { .. })
    }
}

/// Link of a pending record, with the target's goff once it exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkTarget {
    /// Linked hash.
    pub hash: Hash,
    /// Goff of the linked record if stored.
    pub goff: Option<Goff>,
}

/// What the weight worker needs to evaluate one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightJob {
    /// Content hash.
    pub hash: Hash,
    /// Proof-of-work value.
    pub work: u64,
    /// Still flagged pending.
    pub pending: bool,
    /// Direct links in declaration order.
    pub links: Vec<LinkTarget>,
}

/// Network address of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PeerAddress {
    /// IP address.
    pub ip: IpAddr,
    /// TCP port.
    pub port: u16,
}

impl PeerAddress {
    fn address_type(&self) -> i64 {
        match self.ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    fn address_bytes(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    fn from_row(address_type: i64, bytes: &[u8], port: i64) -> Result<Self> {
        let ip = match address_type {
            4 => {
                let octets: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| DagError::Corruption("ipv4 peer address must be 4 bytes"))?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let octets: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| DagError::Corruption("ipv6 peer address must be 16 bytes"))?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(DagError::Corruption("unknown peer address type")),
        };
        Ok(Self {
            ip,
            port: port as u16,
        })
    }
}

struct RawRecord {
    goff: i64,
    hash: Vec<u8>,
    id: Vec<u8>,
    owner: Vec<u8>,
    selector0: Vec<u8>,
    selector1: Option<Vec<u8>>,
    ts: i64,
    work: i64,
    size: i64,
    pending: bool,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            goff: row.get(0)?,
            hash: row.get(1)?,
            id: row.get(2)?,
            owner: row.get(3)?,
            selector0: row.get(4)?,
            selector1: row.get(5)?,
            ts: row.get(6)?,
            work: row.get(7)?,
            size: row.get(8)?,
            pending: row.get::<_, i64>(9)? != 0,
        })
    }

    fn into_meta(self, conn: &Connection) -> Result<RecordMeta> {
        let mut selectors = vec![Selector::from_slice(&self.selector0)?];
        if let Some(second) = &self.selector1 {
            selectors.push(Selector::from_slice(second)?);
        }
        let goff = Goff(self.goff as u64);
        Ok(RecordMeta {
            goff,
            hash: Hash::from_slice(&self.hash)?,
            id: RecordId::from_slice(&self.id)?,
            owner: Owner::from_slice(&self.owner)?,
            selectors,
            timestamp: self.ts as u64,
            work: self.work as u64,
            size: self.size as u64,
            links: links_of(conn, goff)?,
            pending: self.pending,
        })
    }
}

/// Durable record metadata, graph edges and peer bookkeeping.
pub struct MetaStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>, synchronous: Synchronous) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", synchronous.as_str())?;
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            path,
            conn: Mutex::new(conn),
        };
        match store.get_meta(KEY_SCHEMA_VERSION)? {
            None => store.set_meta(KEY_SCHEMA_VERSION, SCHEMA_VERSION)?,
            Some(version) if version == SCHEMA_VERSION => {}
            Some(_) => return Err(DagError::Corruption("unsupported metadata schema version")),
        }
        debug!(path = %store.path.display(), "meta.open");
        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Runs `f` against a hole/dangling tracker inside one transaction.
    pub fn with_tracker<T>(&self, f: impl FnOnce(&Tracker<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&Tracker::new(&tx))?;
        tx.commit()?;
        Ok(out)
    }

    /// Stores `record` at `goff`, recording dangling links for unknown
    /// targets and resolving dangling links that pointed at it.
    pub fn put(&self, record: &Record, goff: Goff) -> Result<PutOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if let Some(existing) = goff_by_hash(&tx, &record.hash())? {
            return Ok(PutOutcome::Duplicate { goff: existing });
        }
        insert_record(&tx, record, goff)?;
        let tracker = Tracker::new(&tx);
        for (idx, link) in record.links().iter().enumerate() {
            tx.prepare_cached("INSERT INTO link (from_goff, idx, to_hash) VALUES (?1, ?2, ?3)")?
                .execute(params![goff.0 as i64, idx as i64, &link.0[..]])?;
            if goff_by_hash(&tx, link)?.is_none() {
                tracker.record_dangling(goff, link)?;
            }
        }
        let released = tracker.resolve(&record.hash())?;
        tx.commit()?;
        Ok(PutOutcome::Stored { goff, released })
    }

    /// Goff of the record with `hash`.
    pub fn goff_by_hash(&self, hash: &Hash) -> Result<Option<Goff>> {
        goff_by_hash(&self.lock(), hash)
    }

    /// Whether a record occupies `goff`.
    pub fn goff_exists(&self, goff: Goff) -> Result<bool> {
        let conn = self.lock();
        let found = conn
            .prepare_cached("SELECT 1 FROM record WHERE goff = ?1")?
            .query_row(params![goff.0 as i64], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Metadata of the record with `hash`.
    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<RecordMeta>> {
        let conn = self.lock();
        let raw = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM record WHERE hash = ?1"
            ))?
            .query_row(params![&hash.0[..]], RawRecord::from_row)
            .optional()?;
        raw.map(|raw| raw.into_meta(&conn)).transpose()
    }

    /// Metadata of the record at `goff`.
    pub fn get_by_goff(&self, goff: Goff) -> Result<Option<RecordMeta>> {
        let conn = self.lock();
        let raw = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM record WHERE goff = ?1"
            ))?
            .query_row(params![goff.0 as i64], RawRecord::from_row)
            .optional()?;
        raw.map(|raw| raw.into_meta(&conn)).transpose()
    }

    /// Full record, value included, as it was admitted.
    pub fn get_record(&self, hash: &Hash) -> Result<Option<Record>> {
        let Some(meta) = self.get_by_hash(hash)? else {
            return Ok(None);
        };
        let conn = self.lock();
        let value: Vec<u8> = conn
            .prepare_cached("SELECT value FROM record WHERE goff = ?1")?
            .query_row(params![meta.goff.0 as i64], |row| row.get(0))?;
        Ok(Some(Record::from_parts(
            meta.hash,
            RecordSpec {
                owner: meta.owner,
                selectors: &meta.selectors,
                links: &meta.links,
                value: &value,
                timestamp: meta.timestamp,
                work: meta.work,
            },
        )))
    }

    /// Every revision sharing `id`, by timestamp then hash.
    pub fn get_history_by_id(&self, id: &RecordId) -> Result<Vec<RecordMeta>> {
        let conn = self.lock();
        let raws = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM record WHERE id = ?1 ORDER BY ts, hash"
            ))?
            .query_map(params![&id.0[..]], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(|raw| raw.into_meta(&conn)).collect()
    }

    /// Highest assigned goff, `None` for an empty store.
    pub fn get_max_goff(&self) -> Result<Option<Goff>> {
        let conn = self.lock();
        let max = conn
            .prepare_cached("SELECT MAX(goff) FROM record")?
            .query_row([], |row| row.get::<_, Option<i64>>(0))?;
        Ok(max.map(|goff| Goff(goff as u64)))
    }

    /// Visits `(goff, hash)` of every record in goff order.
    pub fn for_each_record(&self, mut f: impl FnMut(Goff, Hash) -> Result<()>) -> Result<()> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT goff, hash FROM record ORDER BY goff")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let goff = Goff(row.get::<_, i64>(0)? as u64);
            let hash = Hash::from_slice(&row.get::<_, Vec<u8>>(1)?)?;
            f(goff, hash)?;
        }
        Ok(())
    }

    /// Record count and total stored size.
    pub fn record_count_and_size(&self) -> Result<(u64, u64)> {
        let conn = self.lock();
        let (count, size) = conn
            .prepare_cached("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM record")?
            .query_row([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        Ok((count as u64, size as u64))
    }

    /// Marks one record as needing weight application.
    pub fn flag_pending_weight_application(&self, goff: Goff) -> Result<bool> {
        let conn = self.lock();
        let updated = conn
            .prepare_cached("UPDATE record SET pending = 1 WHERE goff = ?1")?
            .execute(params![goff.0 as i64])?;
        Ok(updated > 0)
    }

    /// Marks every record as needing weight application.
    pub fn flag_all_pending(&self) -> Result<u64> {
        let conn = self.lock();
        let updated = conn
            .prepare_cached("UPDATE record SET pending = 1 WHERE pending = 0")?
            .execute([])?;
        Ok(updated as u64)
    }

    /// Up to `limit` pending goffs, ascending.
    pub fn get_records_for_weight_application(&self, limit: usize) -> Result<Vec<Goff>> {
        let conn = self.lock();
        let goffs = conn
            .prepare_cached("SELECT goff FROM record WHERE pending = 1 ORDER BY goff LIMIT ?1")?
            .query_map(params![limit as i64], |row| row.get::<_, i64>(0))?
            .map(|goff| goff.map(|g| Goff(g as u64)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(goffs)
    }

    /// Whether any record is still pending.
    pub fn has_pending(&self) -> Result<bool> {
        let conn = self.lock();
        let found = conn
            .prepare_cached("SELECT 1 FROM record WHERE pending = 1 LIMIT 1")?
            .query_row([], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Clears the pending flag of every goff in `goffs` in one transaction.
    pub fn delete_completed_pending(&self, goffs: &[Goff]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("UPDATE record SET pending = 0 WHERE goff = ?1")?;
            for goff in goffs {
                stmt.execute(params![goff.0 as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// State the weight worker needs for `goff`.
    pub fn weight_job(&self, goff: Goff) -> Result<Option<WeightJob>> {
        let conn = self.lock();
        let head = conn
            .prepare_cached("SELECT hash, work, pending FROM record WHERE goff = ?1")?
            .query_row(params![goff.0 as i64], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })
            .optional()?;
        let Some((hash, work, pending)) = head else {
            return Ok(None);
        };
        let links = conn
            .prepare_cached(
                "SELECT l.to_hash, r.goff FROM link l LEFT JOIN record r ON r.hash = l.to_hash
                 WHERE l.from_goff = ?1 ORDER BY l.idx",
            )?
            .query_map(params![goff.0 as i64], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<i64>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let links = links
            .into_iter()
            .map(|(hash, target)| {
                Ok(LinkTarget {
                    hash: Hash::from_slice(&hash)?,
                    goff: target.map(|g| Goff(g as u64)),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(WeightJob {
            hash: Hash::from_slice(&hash)?,
            work: work as u64,
            pending,
            links,
        }))
    }

    /// Every `(from, to)` link edge between stored records reachable from
    /// `goff`, found with one recursive query.
    pub fn ancestor_edges(&self, goff: Goff) -> Result<Vec<(Goff, Goff)>> {
        let conn = self.lock();
        let edges = conn
            .prepare_cached(
                "WITH RECURSIVE reach(goff) AS (
                    SELECT ?1
                    UNION
                    SELECT r.goff FROM reach
                    JOIN link l ON l.from_goff = reach.goff
                    JOIN record r ON r.hash = l.to_hash
                 )
                 SELECT l.from_goff, r.goff FROM reach
                 JOIN link l ON l.from_goff = reach.goff
                 JOIN record r ON r.hash = l.to_hash",
            )?
            .query_map(params![goff.0 as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .map(|edge| edge.map(|(from, to)| (Goff(from as u64), Goff(to as u64))))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Goffs of the records that link to `hash`.
    pub fn referrers(&self, hash: &Hash) -> Result<Vec<Goff>> {
        let conn = self.lock();
        let goffs = conn
            .prepare_cached("SELECT from_goff FROM link WHERE to_hash = ?1 ORDER BY from_goff")?
            .query_map(params![&hash.0[..]], |row| row.get::<_, i64>(0))?
            .map(|goff| goff.map(|g| Goff(g as u64)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(goffs)
    }

    /// Goff ranges below the highest goff that hold no record.
    pub fn missing_goff_ranges(&self) -> Result<Vec<GoffRange>> {
        let conn = self.lock();
        let mut ranges = Vec::new();
        let first = conn
            .prepare_cached("SELECT MIN(goff) FROM record")?
            .query_row([], |row| row.get::<_, Option<i64>>(0))?;
        if let Some(first) = first.filter(|first| *first > 0) {
            ranges.push(GoffRange::new(Goff(0), Goff(first as u64 - 1))?);
        }
        let gaps = conn
            .prepare_cached(
                "SELECT goff + 1, next - 1 FROM (
                    SELECT goff, LEAD(goff) OVER (ORDER BY goff) AS next FROM record
                 ) WHERE next > goff + 1",
            )?
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (start, end) in gaps {
            ranges.push(GoffRange::new(Goff(start as u64), Goff(end as u64))?);
        }
        Ok(ranges)
    }

    /// Stored goffs inside `range`, ascending.
    pub fn goffs_in(&self, range: GoffRange) -> Result<Vec<Goff>> {
        let conn = self.lock();
        let goffs = conn
            .prepare_cached("SELECT goff FROM record WHERE goff BETWEEN ?1 AND ?2 ORDER BY goff")?
            .query_map(params![range.start.0 as i64, range.end.0 as i64], |row| {
                row.get::<_, i64>(0)
            })?
            .map(|goff| goff.map(|g| Goff(g as u64)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(goffs)
    }

    /// Records a hole outside of any admission.
    pub fn record_hole(&self, hole: &Hole) -> Result<()> {
        self.with_tracker(|tracker| tracker.record_hole(hole))
    }

    /// Removes `range` from outstanding holes; see [`Tracker::resolve_hole`].
    pub fn resolve_hole(&self, range: GoffRange) -> Result<Vec<Goff>> {
        self.with_tracker(|tracker| tracker.resolve_hole(range))
    }

    /// Records a successful outgoing connection. Returns true the first time
    /// this key and address are seen.
    pub fn log_outgoing_peer_connect_success(
        &self,
        key_hash: &Hash,
        address: &PeerAddress,
        now_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let bytes = address.address_bytes();
        let key = (&key_hash.0[..], address.address_type(), &bytes[..], address.port as i64);
        let existed = tx
            .prepare_cached(
                "SELECT 1 FROM peer WHERE key_hash = ?1 AND address_type = ?2 AND address = ?3 AND port = ?4",
            )?
            .query_row(params![key.0, key.1, key.2, key.3], |_| Ok(()))
            .optional()?
            .is_some();
        tx.prepare_cached(
            "INSERT INTO peer (key_hash, address_type, address, port, first_connect_ms, last_connect_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (key_hash, address_type, address, port)
             DO UPDATE SET last_connect_ms = excluded.last_connect_ms",
        )?
        .execute(params![key.0, key.1, key.2, key.3, now_ms as i64])?;
        tx.prepare_cached(
            "DELETE FROM potential_peer WHERE key_hash = ?1 AND address_type = ?2 AND address = ?3 AND port = ?4",
        )?
        .execute(params![key.0, key.1, key.2, key.3])?;
        tx.commit()?;
        Ok(!existed)
    }

    /// Earliest successful connection to a peer key, in Unix milliseconds.
    pub fn peer_first_connect_time(&self, key_hash: &Hash) -> Result<Option<u64>> {
        let conn = self.lock();
        let first = conn
            .prepare_cached("SELECT MIN(first_connect_ms) FROM peer WHERE key_hash = ?1")?
            .query_row(params![&key_hash.0[..]], |row| row.get::<_, Option<i64>>(0))?;
        Ok(first.map(|ms| ms as u64))
    }

    /// Remembers an address worth trying later unless it is already a peer.
    pub fn log_potential_peer(&self, key_hash: &Hash, address: &PeerAddress) -> Result<bool> {
        let conn = self.lock();
        let bytes = address.address_bytes();
        let known = conn
            .prepare_cached(
                "SELECT 1 FROM peer WHERE key_hash = ?1 AND address_type = ?2 AND address = ?3 AND port = ?4",
            )?
            .query_row(
                params![&key_hash.0[..], address.address_type(), &bytes[..], address.port as i64],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if known {
            return Ok(false);
        }
        let inserted = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO potential_peer (key_hash, address_type, address, port)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                &key_hash.0[..],
                address.address_type(),
                &bytes[..],
                address.port as i64
            ])?;
        Ok(inserted > 0)
    }

    /// Up to `limit` potential peers, least retried first. Each returned
    /// entry has its retry counter bumped.
    pub fn potential_peers(&self, limit: usize) -> Result<Vec<(Hash, PeerAddress)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let rows = tx
            .prepare_cached(
                "SELECT key_hash, address_type, address, port FROM potential_peer
                 ORDER BY retries, key_hash LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut peers = Vec::with_capacity(rows.len());
        for (key, address_type, address, port) in rows {
            tx.prepare_cached(
                "UPDATE potential_peer SET retries = retries + 1
                 WHERE key_hash = ?1 AND address_type = ?2 AND address = ?3 AND port = ?4",
            )?
            .execute(params![&key[..], address_type, &address[..], port])?;
            peers.push((
                Hash::from_slice(&key)?,
                PeerAddress::from_row(address_type, &address, port)?,
            ));
        }
        tx.commit()?;
        Ok(peers)
    }

    /// Whether the previous session closed cleanly. An absent marker means a
    /// brand-new database, which counts as clean.
    pub fn was_clean_shutdown(&self) -> Result<bool> {
        Ok(self
            .get_meta(KEY_CLEAN_SHUTDOWN)?
            .map_or(true, |flag| flag == "1"))
    }

    /// Writes the clean-shutdown marker.
    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.set_meta(KEY_CLEAN_SHUTDOWN, if clean { "1" } else { "0" })
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let value = conn
            .prepare_cached("SELECT v FROM meta WHERE k = ?1")?
            .query_row(params![key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.prepare_cached(
            "INSERT INTO meta (k, v) VALUES (?1, ?2) ON CONFLICT (k) DO UPDATE SET v = excluded.v",
        )?
        .execute(params![key, value])?;
        Ok(())
    }
}

fn goff_by_hash(conn: &Connection, hash: &Hash) -> Result<Option<Goff>> {
    let goff = conn
        .prepare_cached("SELECT goff FROM record WHERE hash = ?1")?
        .query_row(params![&hash.0[..]], |row| row.get::<_, i64>(0))
        .optional()?;
    Ok(goff.map(|g| Goff(g as u64)))
}

fn insert_record(tx: &Transaction<'_>, record: &Record, goff: Goff) -> Result<()> {
    let selectors = record.selectors();
    let selector0 = selectors
        .first()
        .ok_or(DagError::Validation("record must carry one or two selectors"))?;
    tx.prepare_cached(
        "INSERT INTO record (goff, hash, id, owner, selector0, selector1, ts, work, size, value, pending)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
    )?
    .execute(params![
        goff.0 as i64,
        &record.hash().0[..],
        &record.id().0[..],
        &record.owner().0[..],
        &selector0.0[..],
        selectors.get(1).map(|s| s.0.to_vec()),
        record.timestamp() as i64,
        record.work() as i64,
        record.size() as i64,
        record.value(),
    ])?;
    Ok(())
}

fn links_of(conn: &Connection, goff: Goff) -> Result<Vec<Hash>> {
    let rows = conn
        .prepare_cached("SELECT to_hash FROM link WHERE from_goff = ?1 ORDER BY idx")?
        .query_map(params![goff.0 as i64], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter().map(|bytes| Hash::from_slice(bytes)).collect()
}
