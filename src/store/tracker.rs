#![forbid(unsafe_code)]

//! Dangling links, wanted hashes and holes in graph completeness.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::types::{DagError, Goff, GoffRange, Hash, Result};

const NO_WAITER: i64 = -1;

/// A known gap in graph completeness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Hole {
    /// Goffs the hole covers.
    pub range: GoffRange,
    /// Record whose weight application waits on the range, if any.
    pub waiter: Option<Goff>,
    /// Times the waiter has been parked on this hole.
    pub retries: u32,
    /// Unix milliseconds after which the waiter is re-evaluated.
    pub retry_at_ms: Option<u64>,
}

impl Hole {
    /// A gap nobody is waiting on yet.
    pub fn gap(range: GoffRange) -> Self {
        Self {
            range,
            waiter: None,
            retries: 0,
            retry_at_ms: None,
        }
    }

    /// `waiter` cannot finish until `on` has been weight-applied.
    pub fn waiting(on: Goff, waiter: Goff) -> Self {
        Self {
            range: GoffRange::point(on),
            waiter: Some(waiter),
            retries: 0,
            retry_at_ms: None,
        }
    }

    /// Re-evaluate `waiter` no earlier than `retry_at_ms`.
    pub fn retry(on: Goff, waiter: Goff, retries: u32, retry_at_ms: u64) -> Self {
        Self {
            range: GoffRange::point(on),
            waiter: Some(waiter),
            retries,
            retry_at_ms: Some(retry_at_ms),
        }
    }
}

/// Dangling-link, wanted-hash and hole bookkeeping.
///
/// Borrows a connection (or an open transaction) so that the rows it writes
/// commit atomically with whatever the caller is doing.
pub struct Tracker<'c> {
    conn: &'c Connection,
}

impl<'c> Tracker<'c> {
    /// Wraps a connection or transaction.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Notes that the record at `from` links to a hash not yet stored.
    pub fn record_dangling(&self, from: Goff, target: &Hash) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO dangling_link (hash, linking_goff) VALUES (?1, ?2)",
            )?
            .execute(params![&target.0[..], from.0 as i64])?;
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO wanted (hash) VALUES (?1)")?
            .execute(params![&target.0[..]])?;
        Ok(())
    }

    /// Deletes every dangling link to `target` and returns the referencing
    /// goffs, ascending. A hash nobody was waiting for yields nothing.
    pub fn resolve(&self, target: &Hash) -> Result<Vec<Goff>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT linking_goff FROM dangling_link WHERE hash = ?1 ORDER BY linking_goff",
        )?;
        let goffs = stmt
            .query_map(params![&target.0[..]], |row| row.get::<_, i64>(0))?
            .map(|goff| goff.map(|g| Goff(g as u64)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.conn
            .prepare_cached("DELETE FROM dangling_link WHERE hash = ?1")?
            .execute(params![&target.0[..]])?;
        self.conn
            .prepare_cached("DELETE FROM wanted WHERE hash = ?1")?
            .execute(params![&target.0[..]])?;
        Ok(goffs)
    }

    /// Hashes referenced by dangling links.
    pub fn list_wanted(&self) -> Result<BTreeSet<Hash>> {
        let mut stmt = self.conn.prepare_cached("SELECT hash FROM wanted")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|bytes| Hash::from_slice(bytes)).collect()
    }

    /// Number of wanted hashes.
    pub fn wanted_count(&self) -> Result<u64> {
        count(self.conn, "SELECT COUNT(*) FROM wanted")
    }

    /// Number of dangling link rows.
    pub fn dangling_count(&self) -> Result<u64> {
        count(self.conn, "SELECT COUNT(*) FROM dangling_link")
    }

    /// Bumps the request counter of a wanted hash; false if it is not wanted.
    pub fn mark_wanted_requested(&self, hash: &Hash, now_ms: u64) -> Result<bool> {
        let updated = self
            .conn
            .prepare_cached(
                "UPDATE wanted SET retries = retries + 1, last_request_ms = ?2 WHERE hash = ?1",
            )?
            .execute(params![&hash.0[..], now_ms as i64])?;
        Ok(updated > 0)
    }

    /// Request counter and last request time of a wanted hash.
    pub fn wanted_requests(&self, hash: &Hash) -> Result<Option<(u32, u64)>> {
        let row = self
            .conn
            .prepare_cached("SELECT retries, last_request_ms FROM wanted WHERE hash = ?1")?
            .query_row(params![&hash.0[..]], |row| {
                Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u64))
            })
            .optional()?;
        Ok(row)
    }

    /// Records or refreshes a hole.
    pub fn record_hole(&self, hole: &Hole) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO hole (start_goff, end_goff, waiting_goff, retries, retry_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (start_goff, end_goff, waiting_goff)
                 DO UPDATE SET retries = excluded.retries, retry_at_ms = excluded.retry_at_ms",
            )?
            .execute(params![
                hole.range.start.0 as i64,
                hole.range.end.0 as i64,
                hole.waiter.map(|g| g.0 as i64).unwrap_or(NO_WAITER),
                hole.retries as i64,
                hole.retry_at_ms.map(|ms| ms as i64),
            ])?;
        Ok(())
    }

    /// Removes `range` from every overlapping hole, splitting holes that only
    /// partly overlap. Returns the waiters left with no hole at all.
    pub fn resolve_hole(&self, range: GoffRange) -> Result<Vec<Goff>> {
        let overlapping = self.query_holes(
            "SELECT start_goff, end_goff, waiting_goff, retries, retry_at_ms FROM hole
             WHERE start_goff <= ?1 AND end_goff >= ?2",
            params![range.end.0 as i64, range.start.0 as i64],
        )?;
        let mut waiters = BTreeSet::new();
        for hole in &overlapping {
            self.take_hole(hole)?;
            for rest in hole.range.subtract(&range) {
                self.record_hole(&Hole { range: rest, ..*hole })?;
            }
            if let Some(waiter) = hole.waiter {
                waiters.insert(waiter);
            }
        }
        let mut released = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            let remaining = self
                .conn
                .prepare_cached("SELECT COUNT(*) FROM hole WHERE waiting_goff = ?1")?
                .query_row(params![waiter.0 as i64], |row| row.get::<_, i64>(0))?;
            if remaining == 0 {
                released.push(waiter);
            }
        }
        Ok(released)
    }

    /// Deletes exactly this hole row.
    pub fn take_hole(&self, hole: &Hole) -> Result<bool> {
        let deleted = self
            .conn
            .prepare_cached(
                "DELETE FROM hole WHERE start_goff = ?1 AND end_goff = ?2 AND waiting_goff = ?3",
            )?
            .execute(params![
                hole.range.start.0 as i64,
                hole.range.end.0 as i64,
                hole.waiter.map(|g| g.0 as i64).unwrap_or(NO_WAITER),
            ])?;
        Ok(deleted > 0)
    }

    /// Holes whose retry time has passed, oldest first.
    pub fn due_holes(&self, now_ms: u64, limit: usize) -> Result<Vec<Hole>> {
        self.query_holes(
            "SELECT start_goff, end_goff, waiting_goff, retries, retry_at_ms FROM hole
             WHERE retry_at_ms IS NOT NULL AND retry_at_ms <= ?1
             ORDER BY retry_at_ms LIMIT ?2",
            params![now_ms as i64, limit as i64],
        )
    }

    /// Every hole, ordered by range.
    pub fn holes(&self) -> Result<Vec<Hole>> {
        self.query_holes(
            "SELECT start_goff, end_goff, waiting_goff, retries, retry_at_ms FROM hole
             ORDER BY start_goff, end_goff, waiting_goff",
            [],
        )
    }

    /// Drops every hole that has a waiter; used before weights are rebuilt.
    pub fn clear_waiting_holes(&self) -> Result<usize> {
        Ok(self
            .conn
            .prepare_cached("DELETE FROM hole WHERE waiting_goff <> ?1")?
            .execute(params![NO_WAITER])?)
    }

    /// Number of outstanding holes.
    pub fn pending_hole_count(&self) -> Result<u64> {
        count(self.conn, "SELECT COUNT(*) FROM hole")
    }

    /// Number of records still waiting for weight application.
    pub fn pending_count(&self) -> Result<u64> {
        count(self.conn, "SELECT COUNT(*) FROM record WHERE pending = 1")
    }

    fn query_holes<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Hole>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(start, end, waiter, retries, retry_at)| {
                if start < 0 || end < start {
                    return Err(DagError::Corruption("hole row with invalid range"));
                }
                Ok(Hole {
                    range: GoffRange {
                        start: Goff(start as u64),
                        end: Goff(end as u64),
                    },
                    waiter: (waiter != NO_WAITER).then_some(Goff(waiter as u64)),
                    retries: retries as u32,
                    retry_at_ms: retry_at.map(|ms| ms as u64),
                })
            })
            .collect()
    }
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n = conn
        .prepare_cached(sql)?
        .query_row([], |row| row.get::<_, i64>(0))?;
    Ok(n as u64)
}
