//! # Cooperative Locks
//!
//! SQLite has no session-scoped advisory locks, so SpiteFlow keeps its own in
//! a table: one row per held lock, keyed by an integer.
//!
//! ```text
//! lock_key │ owner (uuid)  │ acquired_at_ms │ heartbeat_at_ms
//! ─────────┼───────────────┼────────────────┼────────────────
//!       -1 │ 6f1c...       │ 1700000000000  │ 1700000000000   <- append lock
//!        3 │ a9e2...       │ 1700000000000  │ 1700000004000   <- processor #3
//! ```
//!
//! ## Liveness
//!
//! A lock dies with its owner only if the owner stops heartbeating: once
//! `heartbeat_at_ms` is older than `stale_after`, any other owner may take
//! it over. Holders refresh with [`heartbeat`]; a `false` return means the
//! lock was lost.
//!
//! ## Atomicity
//!
//! [`try_acquire`] is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE`
//! statement, so acquisition and stale takeover cannot race.

use std::time::{Duration, Instant};

use rusqlite::{params, Connection};

use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::types::now_ms;

/// Key of the lock that serializes appends under
/// [`WriteSerialization::AdvisoryLock`](crate::WriteSerialization::AdvisoryLock).
///
/// Negative, so it can never collide with a checkpoint row id.
pub const WRITE_LOCK_KEY: i64 = -1;

/// Age after which a dead appender's write lock may be taken over.
pub const WRITE_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Tries once to acquire `key` for `owner`.
///
/// Succeeds if the lock is free, already held by `owner`, or held by someone
/// whose heartbeat is older than `stale_after`.
pub fn try_acquire(
    conn: &Connection,
    tables: &TableNames,
    key: i64,
    owner: &str,
    stale_after: Duration,
) -> Result<bool> {
    let now = i64::try_from(now_ms()).unwrap_or(i64::MAX);
    let stale_before = now.saturating_sub(duration_ms(stale_after));
    let locks = &tables.locks;
    let changed = conn.execute(
        &format!(
            "INSERT INTO {locks} (lock_key, owner, acquired_at_ms, heartbeat_at_ms) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(lock_key) DO UPDATE SET
                 owner = excluded.owner,
                 acquired_at_ms = excluded.acquired_at_ms,
                 heartbeat_at_ms = excluded.heartbeat_at_ms
             WHERE {locks}.owner = excluded.owner OR {locks}.heartbeat_at_ms < ?4"
        ),
        params![key, owner, now, stale_before],
    )?;
    Ok(changed == 1)
}

/// Acquires `key`, polling until `wait` elapses.
///
/// Blocks the calling thread. Fails with [`Error::LockTimeout`].
pub fn acquire_blocking(
    conn: &Connection,
    tables: &TableNames,
    key: i64,
    owner: &str,
    stale_after: Duration,
    wait: Duration,
) -> Result<()> {
    let deadline = Instant::now() + wait;
    let mut interval = Duration::from_millis(1);
    loop {
        if try_acquire(conn, tables, key, owner, stale_after)? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::LockTimeout { key });
        }
        std::thread::sleep(interval.min(deadline - now));
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Releases `key` if `owner` holds it. Returns whether anything was released.
pub fn release(conn: &Connection, tables: &TableNames, key: i64, owner: &str) -> Result<bool> {
    let changed = conn.execute(
        &format!("DELETE FROM {} WHERE lock_key = ? AND owner = ?", tables.locks),
        params![key, owner],
    )?;
    Ok(changed == 1)
}

/// Refreshes the heartbeat. Returns `false` if `owner` no longer holds `key`.
pub fn heartbeat(conn: &Connection, tables: &TableNames, key: i64, owner: &str) -> Result<bool> {
    let now = i64::try_from(now_ms()).unwrap_or(i64::MAX);
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET heartbeat_at_ms = ? WHERE lock_key = ? AND owner = ?",
            tables.locks
        ),
        params![now, key, owner],
    )?;
    Ok(changed == 1)
}
