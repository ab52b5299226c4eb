//! Record-DAG storage with asynchronous weight consensus.
//!
//! Records link to earlier records by hash. Each admitted record gets a dense
//! graph offset (goff), its metadata goes to SQLite, and a background worker
//! folds its proof-of-work contribution into the cumulative weight of every
//! ancestor in a memory-mapped weight file. Records may arrive in any order;
//! missing links are tracked until they show up.

#![warn(missing_docs)]

pub mod primitives;
pub mod record;
pub mod store;
pub mod types;

pub use record::{Record, RecordLimits, RecordSpec};
pub use store::{
    PeerAddress, PutOutcome, RecordMeta, ScoredRecord, StateHash, StatusReport, Store,
    StoreOptions, Synchronous,
};
pub use types::{DagError, Goff, GoffRange, Hash, Owner, RecordId, Result, Selector, Weight};
