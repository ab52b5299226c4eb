#![forbid(unsafe_code)]

//! Identifiers, weights and the crate-wide error type.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of record hashes, record ids and selector ids.
pub const HASH_LEN: usize = 32;

macro_rules! digest_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
        pub struct $name(pub [u8; HASH_LEN]);

        impl $name {
            /// The all-zero value.
            pub const ZERO: Self = Self([0u8; HASH_LEN]);

            /// Borrows the raw bytes.
            pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
                &self.0
            }

            /// Builds a value from a slice that must be exactly 32 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; HASH_LEN] = bytes
                    .try_into()
                    .map_err(|_| DagError::Corruption(concat!(stringify!($name), " must be 32 bytes")))?;
                Ok(Self(arr))
            }

            /// Lowercase hex rendering.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
                Self::from_slice(&bytes).map_err(serde::de::Error::custom)
            }
        }

        impl From<[u8; HASH_LEN]> for $name {
            fn from(value: [u8; HASH_LEN]) -> Self {
                Self(value)
            }
        }
    };
}

digest_newtype!(
    /// Content hash of a record; doubles as its identity.
    Hash
);

digest_newtype!(
    /// Logical key shared by every revision of the same selector set.
    RecordId
);

digest_newtype!(
    /// Selector identifier used to group revisions.
    Selector
);

digest_newtype!(
    /// Owner public key (or its 32-byte digest).
    Owner
);

impl Hash {
    /// Compact back-reference stored in weight file slots.
    ///
    /// Never zero, so a zero back-reference always means an unassigned slot.
    pub fn back_ref(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        match u64::from_le_bytes(prefix) {
            0 => 1,
            v => v,
        }
    }
}

/// Dense graph offset assigned to every admitted record.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Goff(pub u64);

impl fmt::Display for Goff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Goff {
    fn from(value: u64) -> Self {
        Goff(value)
    }
}

impl From<Goff> for u64 {
    fn from(value: Goff) -> Self {
        value.0
    }
}

/// Cumulative acceptance weight.
pub type Weight = u128;

/// Encodes a weight as the 16-byte big-endian form exposed to clients.
pub fn weight_to_be_bytes(weight: Weight) -> [u8; 16] {
    weight.to_be_bytes()
}

/// Inclusive range of goffs tracked as a hole.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct GoffRange {
    /// First goff covered.
    pub start: Goff,
    /// Last goff covered.
    pub end: Goff,
}

impl GoffRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: Goff, end: Goff) -> Result<Self> {
        if start > end {
            return Err(DagError::Validation("hole range start exceeds end"));
        }
        Ok(Self { start, end })
    }

    /// Range covering a single goff.
    pub fn point(goff: Goff) -> Self {
        Self {
            start: goff,
            end: goff,
        }
    }

    /// Number of goffs covered.
    pub fn len(&self) -> u64 {
        self.end.0 - self.start.0 + 1
    }

    /// Always false; ranges cover at least one goff.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `goff` falls inside the range.
    pub fn contains(&self, goff: Goff) -> bool {
        self.start <= goff && goff <= self.end
    }

    /// Whether the two ranges share at least one goff.
    pub fn overlaps(&self, other: &GoffRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Parts of `self` left over after removing `other`.
    pub fn subtract(&self, other: &GoffRange) -> Vec<GoffRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if self.start < other.start {
            rest.push(GoffRange {
                start: self.start,
                end: Goff(other.start.0 - 1),
            });
        }
        if other.end < self.end {
            rest.push(GoffRange {
                start: Goff(other.end.0 + 1),
                end: self.end,
            });
        }
        rest
    }
}

/// Errors raised by the store and its components.
#[derive(Debug, Error)]
pub enum DagError {
    /// Filesystem or mmap failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata store failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The candidate record was rejected at admission.
    #[error("invalid record: {0}")]
    Validation(&'static str),
    /// The weight file could not be extended; ingestion must stop.
    #[error("weight file growth to goff {goff} failed: {source}")]
    Growth {
        /// Goff that required the growth.
        goff: u64,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// Metadata and weight file disagree.
    #[error("inconsistency: {0}")]
    Inconsistency(String),
    /// Persisted state failed a structural check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Options could not be loaded or are out of range.
    #[error("config: {0}")]
    Config(String),
    /// The store is closing and no longer accepts work.
    #[error("store is shutting down")]
    Shutdown,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_splits_around_inner_range() {
        let outer = GoffRange::new(Goff(10), Goff(20)).unwrap();
        let inner = GoffRange::new(Goff(13), Goff(15)).unwrap();
        assert_eq!(
            outer.subtract(&inner),
            vec![
                GoffRange::new(Goff(10), Goff(12)).unwrap(),
                GoffRange::new(Goff(16), Goff(20)).unwrap(),
            ]
        );
        assert!(outer.subtract(&outer).is_empty());
        let disjoint = GoffRange::point(Goff(30));
        assert_eq!(outer.subtract(&disjoint), vec![outer]);
    }

    #[test]
    fn back_ref_is_never_zero() {
        assert_eq!(Hash::ZERO.back_ref(), 1);
        let mut bytes = [0u8; HASH_LEN];
        bytes[0] = 7;
        assert_eq!(Hash(bytes).back_ref(), 7);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            GoffRange::new(Goff(5), Goff(4)),
            Err(DagError::Validation(_))
        ));
    }
}
