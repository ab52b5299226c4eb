//! Low-level building blocks for the store.

/// Sharded locks guarding weight slots.
pub mod concurrency;

/// Memory-mapped, append-grown weight file.
pub mod graphfile;
