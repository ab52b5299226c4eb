#![forbid(unsafe_code)]

//! Record identity and link model.
//!
//! A record is content addressed: its [`Hash`] is computed over every other
//! field, so identity and integrity cannot drift apart. Revisions of the same
//! logical key share a [`RecordId`] derived from their selectors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

use crate::types::{DagError, Hash, Owner, RecordId, Result, Selector, Weight, HASH_LEN};

/// Maximum number of selectors a record may carry.
pub const MAX_SELECTORS: usize = 2;

const HASH_DOMAIN: &[u8] = b"dagstore.record.v1";
const ID_DOMAIN: &[u8] = b"dagstore.id.v1";

/// Link hashes of a record; most records carry only a handful.
pub type Links = SmallVec<[Hash; 4]>;

/// Borrowed description of a record prior to hashing.
#[derive(Clone, Copy, Debug)]
pub struct RecordSpec<'a> {
    /// Owner public key.
    pub owner: Owner,
    /// One or two selector ids.
    pub selectors: &'a [Selector],
    /// Hashes of prior records this one links to.
    pub links: &'a [Hash],
    /// Value bytes, possibly encrypted by the client.
    pub value: &'a [u8],
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Verified proof-of-work value.
    pub work: u64,
}

/// Admission limits normally taken from the network's genesis parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordLimits {
    /// Largest accepted value in bytes.
    pub max_value_size: usize,
    /// How far into the future a timestamp may point, in seconds.
    pub max_forward_drift_secs: u64,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_value_size: 1024,
            max_forward_drift_secs: 60,
        }
    }
}

/// An immutable, content-addressed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    hash: Hash,
    owner: Owner,
    selectors: SmallVec<[Selector; MAX_SELECTORS]>,
    links: Links,
    value: Vec<u8>,
    timestamp: u64,
    work: u64,
}

impl Record {
    /// Builds a record and computes its content hash.
    pub fn new(spec: RecordSpec<'_>) -> Self {
        let mut record = Self::unhashed(spec);
        record.hash = record.compute_hash();
        record
    }

    /// Builds a record around a hash claimed by the sender.
    ///
    /// The claim is checked by [`Record::validate`] at admission.
    pub fn from_parts(hash: Hash, spec: RecordSpec<'_>) -> Self {
        let mut record = Self::unhashed(spec);
        record.hash = hash;
        record
    }

    fn unhashed(spec: RecordSpec<'_>) -> Self {
        Self {
            hash: Hash::ZERO,
            owner: spec.owner,
            selectors: SmallVec::from_slice(spec.selectors),
            links: SmallVec::from_slice(spec.links),
            value: spec.value.to_vec(),
            timestamp: spec.timestamp,
            work: spec.work,
        }
    }

    /// Content hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Owner public key.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Selector ids.
    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    /// Declared links.
    pub fn links(&self) -> &[Hash] {
        &self.links
    }

    /// Value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Timestamp in seconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Proof-of-work value.
    pub fn work(&self) -> u64 {
        self.work
    }

    /// Logical key shared by every revision with the same selectors.
    pub fn id(&self) -> RecordId {
        record_id(&self.selectors)
    }

    /// Weight this record adds to itself and its ancestors.
    pub fn contribution(&self) -> Weight {
        work_contribution(self.work)
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        HASH_LEN * (2 + self.selectors.len() + self.links.len()) + self.value.len() + 16
    }

    /// Recomputes the content hash from the record's fields.
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(self.owner.as_bytes());
        hasher.update([self.selectors.len() as u8]);
        for selector in &self.selectors {
            hasher.update(selector.as_bytes());
        }
        hasher.update((self.links.len() as u32).to_le_bytes());
        for link in &self.links {
            hasher.update(link.as_bytes());
        }
        hasher.update((self.value.len() as u32).to_le_bytes());
        hasher.update(&self.value);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.work.to_le_bytes());
        Hash(hasher.finalize().into())
    }

    /// Structural checks applied before a record is stored.
    pub fn validate(&self, limits: &RecordLimits, now_secs: u64) -> Result<()> {
        if self.selectors.is_empty() || self.selectors.len() > MAX_SELECTORS {
            return Err(DagError::Validation("record must carry one or two selectors"));
        }
        if self.links.iter().any(|link| *link == self.hash) {
            return Err(DagError::Validation("record links to itself"));
        }
        for (idx, link) in self.links.iter().enumerate() {
            if self.links[..idx].contains(link) {
                return Err(DagError::Validation("duplicate link"));
            }
        }
        if self.compute_hash() != self.hash {
            return Err(DagError::Validation("content hash mismatch"));
        }
        if self.value.len() > limits.max_value_size {
            return Err(DagError::Validation("value exceeds maximum size"));
        }
        if self.timestamp > now_secs.saturating_add(limits.max_forward_drift_secs) {
            return Err(DagError::Validation("timestamp too far in the future"));
        }
        Ok(())
    }
}

/// Derives the logical key for a selector set.
pub fn record_id(selectors: &[Selector]) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(ID_DOMAIN);
    hasher.update([selectors.len() as u8]);
    for selector in selectors {
        hasher.update(selector.as_bytes());
    }
    RecordId(hasher.finalize().into())
}

/// Maps a proof-of-work value to the weight it contributes.
///
/// Work values are difficulty-equivalent, so the contribution is the value
/// widened to 128 bits: 2^64 maximal records fit before the accumulator
/// saturates.
pub fn work_contribution(work: u64) -> Weight {
    Weight::from(work)
}
