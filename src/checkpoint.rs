//! # Checkpoint Tracker
//!
//! Persists, per processor name:
//!
//! - `last_processed_event_id`: the primary cursor, advanced after every event
//! - `last_actioned_event_id`: the reactor idempotency cursor, advanced only
//!   with a confirmed emission. `NULL` until first written.
//!
//! and enforces single-instance execution with a cooperative lock keyed by the
//! checkpoint row id.
//!
//! ## Transactional Variants
//!
//! Every mutation has an `_in` form that takes a `&Connection` (a
//! `Transaction` derefs to one), so processors can advance cursors in the same
//! transaction as their side effects.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LockMode, TableNames};
use crate::error::{Error, Result};
use crate::lock;
use crate::store::EventStore;
use crate::types::EventId;

// =============================================================================
// Processor Lock Guard
// =============================================================================

/// Proof that this instance owns a processor. Releases the lock on drop.
///
/// With [`LockMode::Skip`] the guard holds nothing.
#[derive(Debug)]
pub struct ProcessorLock {
    store: Arc<EventStore>,
    name: String,
    key: Option<i64>,
    owner: String,
}

impl ProcessorLock {
    /// The processor this lock belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an actual lock is held.
    pub fn is_held(&self) -> bool {
        self.key.is_some()
    }

    /// Refreshes the lock heartbeat.
    ///
    /// Fails with `Error::UnableToLockProcessor` if another instance took the
    /// lock over after it went stale.
    pub fn heartbeat(&self) -> Result<()> {
        let Some(key) = self.key else {
            return Ok(());
        };
        let held = self
            .store
            .with_connection(|conn| lock::heartbeat(conn, self.store.tables(), key, &self.owner))?;
        if !held {
            warn!(processor = %self.name, "processor lock lost to another instance");
            return Err(Error::UnableToLockProcessor {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for ProcessorLock {
    fn drop(&mut self) {
        let Some(key) = self.key else {
            return;
        };
        let released = self
            .store
            .with_connection(|conn| lock::release(conn, self.store.tables(), key, &self.owner));
        match released {
            Ok(_) => debug!(processor = %self.name, "released processor lock"),
            Err(e) => warn!(processor = %self.name, error = %e, "failed to release processor lock"),
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Reads and writes processor checkpoints through one store handle.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    store: Arc<EventStore>,
    owner: String,
    lock_mode: LockMode,
    stale_after: Duration,
}

impl CheckpointTracker {
    /// Creates a tracker with a fresh random lock owner token.
    pub fn new(store: Arc<EventStore>, lock_mode: LockMode, stale_after: Duration) -> Self {
        Self {
            store,
            owner: Uuid::new_v4().to_string(),
            lock_mode,
            stale_after,
        }
    }

    /// The store handle this tracker writes through.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    fn tables(&self) -> &TableNames {
        self.store.tables()
    }

    /// Creates the checkpoint row if missing and takes the processor lock.
    ///
    /// Idempotent: an existing row keeps its cursors.
    pub fn setup(&self, name: &str) -> Result<ProcessorLock> {
        let checkpoints = &self.tables().checkpoints;
        let row_id: i64 = self.store.transaction(|tx| {
            tx.execute(
                &format!("INSERT OR IGNORE INTO {checkpoints} (name) VALUES (?)"),
                params![name],
            )?;
            Ok(tx.query_row(
                &format!("SELECT id FROM {checkpoints} WHERE name = ?"),
                params![name],
                |row| row.get(0),
            )?)
        })?;

        let key = match self.lock_mode {
            LockMode::Skip => None,
            LockMode::Exclusive => {
                let acquired = self.store.with_connection(|conn| {
                    lock::try_acquire(conn, self.tables(), row_id, &self.owner, self.stale_after)
                })?;
                if !acquired {
                    return Err(Error::UnableToLockProcessor {
                        name: name.to_string(),
                    });
                }
                Some(row_id)
            }
        };

        info!(processor = %name, locked = key.is_some(), "checkpoint ready");
        Ok(ProcessorLock {
            store: Arc::clone(&self.store),
            name: name.to_string(),
            key,
            owner: self.owner.clone(),
        })
    }

    // =========================================================================
    // Primary Cursor
    // =========================================================================

    /// The last processed event id, zero if nothing was processed yet.
    pub fn last_processed(&self, name: &str) -> Result<EventId> {
        self.store.with_connection(|conn| self.last_processed_in(conn, name))
    }

    /// [`last_processed`](Self::last_processed) on a caller's connection.
    pub fn last_processed_in(&self, conn: &Connection, name: &str) -> Result<EventId> {
        let id: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT last_processed_event_id FROM {} WHERE name = ?",
                    self.tables().checkpoints
                ),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(EventId::from_sql).unwrap_or(EventId::ZERO))
    }

    /// Sets the primary cursor.
    pub fn record_processed(&self, name: &str, id: EventId) -> Result<()> {
        self.store.with_connection(|conn| self.record_processed_in(conn, name, id))
    }

    /// [`record_processed`](Self::record_processed) on a caller's connection.
    pub fn record_processed_in(&self, conn: &Connection, name: &str, id: EventId) -> Result<()> {
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET last_processed_event_id = ? WHERE name = ?",
                self.tables().checkpoints
            ),
            params![id.as_sql(), name],
        )?;
        expect_row(changed, name)
    }

    /// Runs `work` and advances the cursor to `id` in one transaction.
    ///
    /// An error from `work` rolls both back, leaving the cursor where it was.
    pub fn with_processing<R, F>(&self, name: &str, id: EventId, work: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        self.store.transaction(|tx| {
            let value = work(tx)?;
            self.record_processed_in(tx, name, id)?;
            Ok(value)
        })
    }

    /// Zeroes the primary cursor. The actioned cursor is left untouched.
    pub fn reset(&self, name: &str) -> Result<()> {
        self.record_processed(name, EventId::ZERO)?;
        info!(processor = %name, "checkpoint reset");
        Ok(())
    }

    // =========================================================================
    // Actioned Cursor
    // =========================================================================

    /// The last source event whose emissions were confirmed, `None` if never
    /// recorded.
    pub fn last_actioned(&self, name: &str) -> Result<Option<EventId>> {
        self.store.with_connection(|conn| self.last_actioned_in(conn, name))
    }

    /// [`last_actioned`](Self::last_actioned) on a caller's connection.
    pub fn last_actioned_in(&self, conn: &Connection, name: &str) -> Result<Option<EventId>> {
        let id: Option<Option<i64>> = conn
            .query_row(
                &format!(
                    "SELECT last_actioned_event_id FROM {} WHERE name = ?",
                    self.tables().checkpoints
                ),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.flatten().map(EventId::from_sql))
    }

    /// Sets the actioned cursor.
    pub fn record_actioned(&self, name: &str, id: EventId) -> Result<()> {
        self.store.with_connection(|conn| self.record_actioned_in(conn, name, id))
    }

    /// [`record_actioned`](Self::record_actioned) on a caller's connection.
    pub fn record_actioned_in(&self, conn: &Connection, name: &str, id: EventId) -> Result<()> {
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET last_actioned_event_id = ? WHERE name = ?",
                self.tables().checkpoints
            ),
            params![id.as_sql(), name],
        )?;
        expect_row(changed, name)
    }
}

fn expect_row(changed: usize, name: &str) -> Result<()> {
    if changed == 0 {
        return Err(Error::InvalidInput(format!(
            "no checkpoint for processor '{name}'; run setup first"
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::notifier::LocalNotifier;

    const STALE: Duration = Duration::from_secs(30);

    fn temp_store() -> (tempfile::TempDir, Arc<EventStore>) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = EventStore::open_with(
            dir.path().join("checkpoints.db"),
            StoreConfig::default(),
            Arc::new(LocalNotifier::new()),
        )
        .expect("should open store");
        (dir, Arc::new(store))
    }

    #[test]
    fn test_setup_starts_at_zero_and_null_actioned() {
        let (_dir, store) = temp_store();
        let tracker = CheckpointTracker::new(store, LockMode::Exclusive, STALE);
        let _lock = tracker.setup("views").unwrap();

        assert_eq!(tracker.last_processed("views").unwrap(), EventId::ZERO);
        assert_eq!(tracker.last_actioned("views").unwrap(), None);
    }

    #[test]
    fn test_setup_is_idempotent_and_keeps_cursor() {
        let (_dir, store) = temp_store();
        let tracker = CheckpointTracker::new(store, LockMode::Exclusive, STALE);
        {
            let _lock = tracker.setup("views").unwrap();
            tracker.record_processed("views", EventId::from_raw(12)).unwrap();
        }
        let _lock = tracker.setup("views").unwrap();
        assert_eq!(tracker.last_processed("views").unwrap(), EventId::from_raw(12));
    }

    #[test]
    fn test_second_instance_cannot_lock() {
        let (_dir, store) = temp_store();
        let first = CheckpointTracker::new(Arc::clone(&store), LockMode::Exclusive, STALE);
        let second = CheckpointTracker::new(store, LockMode::Exclusive, STALE);

        let lock = first.setup("mailer").unwrap();
        let err = second.setup("mailer").unwrap_err();
        assert!(matches!(err, Error::UnableToLockProcessor { ref name } if name == "mailer"));

        drop(lock);
        second.setup("mailer").expect("lock should be free after drop");
    }

    #[test]
    fn test_skip_mode_takes_no_lock() {
        let (_dir, store) = temp_store();
        let holder = CheckpointTracker::new(Arc::clone(&store), LockMode::Exclusive, STALE);
        let skipper = CheckpointTracker::new(store, LockMode::Skip, STALE);

        let _held = holder.setup("mailer").unwrap();
        let skipped = skipper.setup("mailer").unwrap();
        assert!(!skipped.is_held());
        skipped.heartbeat().unwrap();
    }

    #[test]
    fn test_stale_lock_is_taken_over_and_old_heartbeat_fails() {
        let (_dir, store) = temp_store();
        let first = CheckpointTracker::new(Arc::clone(&store), LockMode::Exclusive, STALE);
        let second = CheckpointTracker::new(Arc::clone(&store), LockMode::Exclusive, STALE);

        let old = first.setup("mailer").unwrap();
        store
            .with_connection(|conn| {
                conn.execute("UPDATE cooperative_locks SET heartbeat_at_ms = 0", [])?;
                Ok(())
            })
            .unwrap();

        let new = second.setup("mailer").expect("stale lock should be taken over");
        assert!(matches!(old.heartbeat(), Err(Error::UnableToLockProcessor { .. })));
        new.heartbeat().unwrap();
    }

    #[test]
    fn test_reset_leaves_actioned_cursor() {
        let (_dir, store) = temp_store();
        let tracker = CheckpointTracker::new(store, LockMode::Skip, STALE);
        let _lock = tracker.setup("echo").unwrap();

        tracker.record_processed("echo", EventId::from_raw(5)).unwrap();
        tracker.record_actioned("echo", EventId::from_raw(5)).unwrap();
        tracker.reset("echo").unwrap();

        assert_eq!(tracker.last_processed("echo").unwrap(), EventId::ZERO);
        assert_eq!(tracker.last_actioned("echo").unwrap(), Some(EventId::from_raw(5)));
    }

    #[test]
    fn test_with_processing_rolls_back_together() {
        let (_dir, store) = temp_store();
        let tracker = CheckpointTracker::new(store, LockMode::Skip, STALE);
        let _lock = tracker.setup("views").unwrap();
        tracker
            .store()
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE view_rows (v INTEGER)")?;
                Ok(())
            })
            .unwrap();

        let failed: Result<()> = tracker.with_processing("views", EventId::from_raw(3), |tx| {
            tx.execute("INSERT INTO view_rows (v) VALUES (1)", [])?;
            Err(Error::Runtime("boom".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(tracker.last_processed("views").unwrap(), EventId::ZERO);

        tracker
            .with_processing("views", EventId::from_raw(3), |tx| {
                tx.execute("INSERT INTO view_rows (v) VALUES (1)", [])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(tracker.last_processed("views").unwrap(), EventId::from_raw(3));

        let rows: i64 = tracker
            .store()
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM view_rows", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_record_on_unknown_processor_fails() {
        let (_dir, store) = temp_store();
        let tracker = CheckpointTracker::new(store, LockMode::Skip, STALE);
        assert!(matches!(
            tracker.record_processed("ghost", EventId::FIRST),
            Err(Error::InvalidInput(_))
        ));
    }
}
