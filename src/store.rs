//! # Event Store
//!
//! [`EventStore`] is a handle on one SQLite connection plus the process-wide
//! change notifier. Every thread that touches the store owns its own handle
//! ([`EventStore::try_clone`]); handles share the database file and the
//! notifier, nothing else.
//!
//! ## Append Protocol
//!
//! ```text
//! BEGIN (strategy dependent)
//!   SELECT version FROM aggregates WHERE aggregate_id = ?      -- current
//!   expected given and != current  →  ROLLBACK, Error::Concurrency
//!   INSERT INTO events ... version = current + 1              -- id from AUTOINCREMENT
//!   INSERT INTO events ... version = current + 2
//!   ...
//!   UPSERT aggregates SET version = current + n
//! COMMIT
//! notifier.publish(last id)                                   -- after commit only
//! ```
//!
//! ## Commit Order = Id Order
//!
//! A tailing reader at cursor `c` asks for `id > c`. If writer A reserved id 7
//! but writer B committed id 8 first, the reader would move past 7 before it
//! became visible and never see it. Every [`WriteSerialization`] holds one
//! writer-wide lock from before the first id is allocated until commit, which
//! makes that interleaving impossible. `tests/concurrent_writers_test.rs`
//! checks this for every strategy.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{StoreConfig, TableNames, WriteSerialization};
use crate::error::{Error, Result};
use crate::lock::{self, WRITE_LOCK_KEY, WRITE_LOCK_STALE_AFTER};
use crate::notifier::{ChangeNotifier, LocalNotifier};
use crate::reader;
use crate::schema::Database;
use crate::types::{now_ms, AggregateId, AppendResult, Event, EventId, EventTypes, NewEvent, Version};

// =============================================================================
// Transactional Append
// =============================================================================

/// Runs the append protocol inside a caller-owned transaction.
///
/// Nothing is committed and no notification is published; both are the
/// caller's job. Used by reactors, inside [`EventStore::write_transaction`], to
/// commit emitted events together with their checkpoint advance.
///
/// # Errors
///
/// - `Error::InvalidInput` if `events` is empty
/// - `Error::MultiAggregateWrite` if events target more than one aggregate
/// - `Error::Concurrency` if `expected` is given and differs from the stored
///   version
/// - `Error::Sqlite` for everything else
pub fn append_in(
    tx: &Transaction<'_>,
    tables: &TableNames,
    events: &[NewEvent],
    expected: Option<Version>,
) -> Result<AppendResult> {
    let aggregate_id = single_aggregate(events)?;

    let current = reader::current_version(tx, tables, &aggregate_id)?;
    if let Some(expected) = expected {
        if expected != current {
            return Err(Error::Concurrency {
                aggregate_id,
                expected,
                actual: current,
            });
        }
    }

    let created_at_ms = i64::try_from(now_ms()).unwrap_or(i64::MAX);
    let mut event_ids = Vec::with_capacity(events.len());
    let mut version = current;
    {
        let mut insert = tx.prepare_cached(&format!(
            "INSERT INTO {} (uuid, aggregate_id, type, body, version, created_at_ms, correlation_id, causation_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            tables.events
        ))?;
        for event in events {
            version = version.next();
            insert.execute(params![
                event.uuid.to_string(),
                aggregate_id.as_str(),
                event.event_type,
                serde_json::to_string(&event.body)?,
                version.as_sql(),
                created_at_ms,
                event.correlation_id.map(|u| u.to_string()),
                event.causation_id.map(|u| u.to_string()),
            ])?;
            event_ids.push(EventId::from_sql(tx.last_insert_rowid()));
        }
    }

    tx.execute(
        &format!(
            "INSERT INTO {} (aggregate_id, version) VALUES (?1, ?2)
             ON CONFLICT(aggregate_id) DO UPDATE SET version = excluded.version",
            tables.aggregates
        ),
        params![aggregate_id.as_str(), version.as_sql()],
    )?;

    Ok(AppendResult {
        aggregate_id,
        event_ids,
        first_version: current.next(),
        last_version: version,
    })
}

fn single_aggregate(events: &[NewEvent]) -> Result<AggregateId> {
    let first = events
        .first()
        .ok_or_else(|| Error::InvalidInput("append requires at least one event".to_string()))?;
    if let Some(other) = events.iter().find(|e| e.aggregate_id != first.aggregate_id) {
        return Err(Error::MultiAggregateWrite {
            first: first.aggregate_id.clone(),
            other: other.aggregate_id.clone(),
        });
    }
    Ok(first.aggregate_id.clone())
}

// =============================================================================
// Store Handle
// =============================================================================

/// A connection-owning handle on the event store.
///
/// `EventStore` is `Send + Sync`: the connection sits behind a mutex, so one
/// handle may be shared, but concurrent callers then take turns. Give each
/// thread its own handle via [`try_clone`](Self::try_clone) instead.
pub struct EventStore {
    path: PathBuf,
    config: StoreConfig,
    notifier: Arc<dyn ChangeNotifier>,
    db: Mutex<Database>,
    owner: String,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.path)
            .field("write_serialization", &self.config.write_serialization)
            .finish()
    }
}

impl EventStore {
    /// Opens a store with default configuration and a fresh [`LocalNotifier`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreConfig::default(), Arc::new(LocalNotifier::new()))
    }

    /// Opens a store with explicit configuration and notifier.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: StoreConfig,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::open_with(&path, &config)?;
        Ok(Self {
            path,
            config,
            notifier,
            db: Mutex::new(db),
            owner: Uuid::new_v4().to_string(),
        })
    }

    /// Opens another handle with its own connection, sharing the notifier.
    pub fn try_clone(&self) -> Result<Self> {
        Self::open_with(&self.path, self.config.clone(), Arc::clone(&self.notifier))
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Table names in use.
    pub fn tables(&self) -> &TableNames {
        &self.config.tables
    }

    /// The shared change notifier.
    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.notifier
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Runtime("store connection mutex poisoned".to_string()))
    }

    /// Runs `f` with this handle's connection.
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let db = self.db()?;
        f(db.connection())
    }

    /// Runs `f` inside an IMMEDIATE transaction, committing if it succeeds.
    ///
    /// An error from `f` rolls everything back.
    ///
    /// For checkpoint and projection writes. Event inserts go through
    /// [`write_transaction`](Self::write_transaction) instead.
    pub fn transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut db = self.db()?;
        Self::commit_with(&mut db, TransactionBehavior::Immediate, f)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends events for one aggregate.
    ///
    /// `expected` of `None` appends at whatever the current version is.
    ///
    /// ```rust,no_run
    /// use serde_json::json;
    /// use spiteflow::{EventStore, NewEvent, Version};
    ///
    /// let store = EventStore::open("events.db")?;
    /// let result = store.append(
    ///     vec![NewEvent::new("order-1", "placed", json!({"total": 10}))],
    ///     Some(Version::NONE),
    /// )?;
    /// assert_eq!(result.last_version, Version::FIRST);
    /// # Ok::<(), spiteflow::Error>(())
    /// ```
    pub fn append(&self, events: Vec<NewEvent>, expected: Option<Version>) -> Result<AppendResult> {
        let result = self.write_transaction(|tx| append_in(tx, self.tables(), &events, expected));

        match result {
            Ok(result) => {
                debug!(
                    aggregate_id = %result.aggregate_id,
                    count = result.event_count(),
                    last_id = %result.last_id(),
                    version = %result.last_version,
                    "appended events"
                );
                self.notifier.publish(result.last_id());
                Ok(result)
            }
            Err(e) => {
                if let Error::Concurrency { aggregate_id, expected, actual } = &e {
                    debug!(%aggregate_id, %expected, %actual, "append rejected: version conflict");
                }
                Err(e)
            }
        }
    }

    /// Runs `f` in a transaction serialized against every other writer.
    ///
    /// The transaction is opened the way the configured [`WriteSerialization`]
    /// dictates, so anything that inserts events (through [`append_in`]) keeps
    /// commit order equal to id order. Nothing is published; that is the
    /// caller's job after this returns.
    ///
    /// # Errors
    ///
    /// - `Error::LockTimeout` if the advisory write lock is not acquired within
    ///   `lock_wait`
    /// - whatever `f` returns, after rolling back
    pub fn write_transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut db = self.db()?;
        match self.config.write_serialization {
            WriteSerialization::Transaction => Self::commit_with(&mut db, TransactionBehavior::Immediate, f),
            WriteSerialization::ExclusiveLock => Self::commit_with(&mut db, TransactionBehavior::Exclusive, f),
            WriteSerialization::AdvisoryLock => self.commit_under_write_lock(&mut db, f),
        }
    }

    fn commit_with<R>(
        db: &mut Database,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let tx = db.connection_mut().transaction_with_behavior(behavior)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn commit_under_write_lock<R>(
        &self,
        db: &mut Database,
        f: impl FnOnce(&Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        let tables = db.tables().clone();
        lock::acquire_blocking(
            db.connection(),
            &tables,
            WRITE_LOCK_KEY,
            &self.owner,
            WRITE_LOCK_STALE_AFTER,
            self.config.lock_wait,
        )?;

        let result = Self::commit_with(db, TransactionBehavior::Immediate, f);

        if let Err(e) = lock::release(db.connection(), &tables, WRITE_LOCK_KEY, &self.owner) {
            warn!(error = %e, "failed to release write lock; it expires when stale");
        }
        result
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Events with `id >= from`, optionally filtered, ascending, at most `limit`.
    pub fn read_from(&self, from: EventId, types: &EventTypes, limit: usize) -> Result<Vec<Event>> {
        self.with_connection(|conn| reader::read_from(conn, self.tables(), from, types, limit))
    }

    /// Highest id matching the filter, or zero.
    pub fn latest_id(&self, types: &EventTypes) -> Result<EventId> {
        self.with_connection(|conn| reader::latest_id(conn, self.tables(), types))
    }

    /// Full ordered history of one aggregate.
    pub fn read_for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<Event>> {
        self.with_connection(|conn| reader::read_for_aggregate(conn, self.tables(), aggregate_id))
    }

    /// The aggregate's current version, zero if unknown.
    pub fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        self.with_connection(|conn| reader::current_version(conn, self.tables(), aggregate_id))
    }

    /// Visits every event in `[from, to]` in pages of `batch_size`.
    pub fn scan_range<F>(
        &self,
        from: EventId,
        to: EventId,
        types: &EventTypes,
        batch_size: usize,
        visit: F,
    ) -> Result<u64>
    where
        F: FnMut(&Event) -> Result<()>,
    {
        self.with_connection(|conn| {
            reader::scan_range(conn, self.tables(), from, to, types, batch_size, visit)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
