//! Translation between absolute expiration instants and per-write TTLs.
//!
//! Entities carry `expiration` as absolute epoch milliseconds. The store only
//! understands a relative TTL in whole seconds, so the TTL is derived at the
//! moment of each write. A record written late still expires at its original
//! instant.

use serde::Serialize;

use crate::storage::{Database, DatabaseError, RowKey, Table};

/// A record whose physical lifetime is bounded by an absolute deadline.
pub trait Expirable {
    /// Absolute expiration in epoch milliseconds, `None` for "never".
    fn expiration(&self) -> Option<i64>;
}

/// `(expiration - now) / 1000`, rounded down and clamped to `i32`.
///
/// Zero or negative results are returned as-is: the store expires such rows
/// immediately, and retried writes stay idempotent.
pub fn to_ttl_seconds(expiration_ms: i64, now_ms: i64) -> i32 {
    let seconds = expiration_ms.saturating_sub(now_ms).div_euclid(1000);
    seconds.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// TTL for an optional expiration; `None` means write without expiry.
pub fn ttl_for(expiration_ms: Option<i64>, now_ms: i64) -> Option<i32> {
    expiration_ms.map(|at| to_ttl_seconds(at, now_ms))
}

/// Absolute instant a row written at `now_ms` with `ttl_seconds` expires.
pub fn expiration_from_ttl(ttl_seconds: i32, now_ms: i64) -> i64 {
    now_ms.saturating_add(i64::from(ttl_seconds) * 1000)
}

/// Write an expirable record, deriving its TTL from the database clock at
/// write time. Returns the TTL that was applied.
pub fn put_expirable<T: Serialize + Expirable>(
    db: &Database,
    table: Table,
    key: &RowKey,
    record: &T,
) -> Result<Option<i32>, DatabaseError> {
    let ttl = ttl_for(record.expiration(), db.now_millis());
    db.put_record(table, key, record, ttl)?;
    Ok(ttl)
}
