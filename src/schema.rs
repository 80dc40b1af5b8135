//! # SQLite Schema for SpiteFlow
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  events                              aggregates                         │
//! │  ┌──────────────────────────┐        ┌──────────────────┐               │
//! │  │ id (PK, AUTOINCREMENT)   │        │ aggregate_id (PK)│               │
//! │  │ uuid (UNIQUE)            │        │ version          │               │
//! │  │ aggregate_id ────────────┼───────►└──────────────────┘               │
//! │  │ type, body (JSON)        │                                           │
//! │  │ version                  │        processor_checkpoints              │
//! │  │ created_at_ms            │        ┌──────────────────────────┐       │
//! │  │ correlation_id           │        │ id (PK) ── lock key      │       │
//! │  │ causation_id             │        │ name (UNIQUE)            │       │
//! │  └──────────────────────────┘        │ last_processed_event_id  │       │
//! │                                      │ last_actioned_event_id   │       │
//! │  cooperative_locks                   └──────────────────────────┘       │
//! │  ┌──────────────────────────┐                                           │
//! │  │ lock_key (PK), owner     │                                           │
//! │  │ acquired_at_ms           │                                           │
//! │  │ heartbeat_at_ms          │                                           │
//! │  └──────────────────────────┘                                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configurable Names
//!
//! The four data tables take their names from [`TableNames`], so several
//! independent logs can share one database file. Names are validated as plain
//! identifiers before being interpolated into DDL. The metadata table name is
//! fixed.
//!
//! ## Why AUTOINCREMENT?
//!
//! Plain `INTEGER PRIMARY KEY` may reuse the id of the newest row after it is
//! deleted. `AUTOINCREMENT` keeps a high-water mark in `sqlite_sequence`, so an
//! id is never handed out twice, not even after a rollback.

use std::path::Path;

use rusqlite::Connection;

use crate::config::{StoreConfig, TableNames};
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Name of the schema metadata table.
pub const METADATA_TABLE: &str = "spiteflow_metadata";

// =============================================================================
// DDL Statements
// =============================================================================

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spiteflow_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// The event log.
///
/// # Indexes
///
/// - PRIMARY KEY on id: range reads from the global log
/// - UNIQUE (aggregate_id, version): enforces gap-free per-aggregate history
///   even if application code misbehaves
/// - (type, id): filtered subscription reads
/// - created_at_ms: time-based inspection
fn create_events(events: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {events} (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid           TEXT NOT NULL UNIQUE,
    aggregate_id   TEXT NOT NULL,
    type           TEXT NOT NULL,
    body           TEXT NOT NULL,
    version        INTEGER NOT NULL,
    created_at_ms  INTEGER NOT NULL,
    correlation_id TEXT,
    causation_id   TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS {events}_aggregate_version ON {events}(aggregate_id, version);
CREATE INDEX IF NOT EXISTS {events}_type ON {events}(type, id);
CREATE INDEX IF NOT EXISTS {events}_created_at ON {events}(created_at_ms);
"#
    )
}

/// Per-aggregate version records, mutated only by the append protocol.
fn create_aggregates(aggregates: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {aggregates} (
    aggregate_id TEXT PRIMARY KEY,
    version      INTEGER NOT NULL
)
"#
    )
}

/// Processor checkpoints.
///
/// `last_actioned_event_id` is NULL until a reactor first records an emission
/// or self-heals it from the log.
fn create_checkpoints(checkpoints: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {checkpoints} (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    name                    TEXT NOT NULL UNIQUE,
    last_processed_event_id INTEGER NOT NULL DEFAULT 0,
    last_actioned_event_id  INTEGER
)
"#
    )
}

/// Cooperative lock records.
///
/// A row exists while some owner holds the lock. `heartbeat_at_ms` lets a new
/// owner take over a lock whose holder died without releasing it.
fn create_locks(locks: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {locks} (
    lock_key        INTEGER PRIMARY KEY,
    owner           TEXT NOT NULL,
    acquired_at_ms  INTEGER NOT NULL,
    heartbeat_at_ms INTEGER NOT NULL
)
"#
    )
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the SpiteFlow schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`; dropping it closes the connection. Each
/// thread that touches the store opens its own `Database`.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    tables: TableNames,
}

impl Database {
    /// Opens a database file with default configuration, creating and
    /// initializing it if necessary.
    ///
    /// ```rust,no_run
    /// use spiteflow::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), spiteflow::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    /// Opens a database file with the given configuration.
    pub fn open_with(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(path)?;
        let mut db = Self {
            conn,
            tables: config.tables.clone(),
        };
        db.initialize(config)?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// An in-memory database lives and dies with this one connection, so it
    /// cannot back an [`EventStore`](crate::EventStore) that opens per-thread
    /// connections.
    pub fn open_in_memory() -> Result<Self> {
        let config = StoreConfig::default();
        let conn = Connection::open_in_memory()?;
        let mut db = Self {
            conn,
            tables: config.tables.clone(),
        };
        db.initialize(&config)?;
        Ok(db)
    }

    fn initialize(&mut self, config: &StoreConfig) -> Result<()> {
        // =====================================================================
        // Pragmas
        // =====================================================================

        // WAL: readers see a consistent snapshot while a writer commits.
        // In-memory databases answer "memory" and stay that way.
        self.conn
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.busy_timeout(config.busy_timeout)?;

        // =====================================================================
        // Tables
        // =====================================================================

        let tables = &self.tables;
        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(&create_events(&tables.events))?;
        self.conn.execute_batch(&create_aggregates(&tables.aggregates))?;
        self.conn.execute_batch(&create_checkpoints(&tables.checkpoints))?;
        self.conn.execute_batch(&create_locks(&tables.locks))?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM spiteflow_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                // INSERT OR IGNORE: two processes may initialize the same file.
                self.conn.execute(
                    "INSERT OR IGNORE INTO spiteflow_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this SpiteFlow version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// The table names this database was opened with.
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Borrows the underlying connection for reads.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Borrows the underlying connection mutably, for transactions.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Consumes the wrapper and returns the raw connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .expect("should prepare");
        stmt.query_map([], |row| row.get(0))
            .expect("should query")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("should collect")
    }

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        assert_eq!(
            table_names(db.connection()),
            vec![
                "aggregates",
                "cooperative_locks",
                "events",
                "processor_checkpoints",
                "spiteflow_metadata",
            ]
        );
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");
        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");
            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };
        assert!(indexes.contains(&"events_aggregate_version".to_string()));
        assert!(indexes.contains(&"events_type".to_string()));
        assert!(indexes.contains(&"events_created_at".to_string()));
    }

    #[test]
    fn test_prefixed_tables() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("prefixed.db");
        let config = StoreConfig::default().with_tables(TableNames::with_prefix("billing_"));
        let db = Database::open_with(&path, &config).expect("should open");
        let names = table_names(db.connection());
        assert!(names.contains(&"billing_events".to_string()));
        assert!(names.contains(&"billing_processor_checkpoints".to_string()));
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("bad.db");
        let config = StoreConfig::default().with_tables(TableNames {
            events: "events; DROP TABLE aggregates".to_string(),
            ..TableNames::default()
        });
        assert!(matches!(Database::open_with(&path, &config), Err(Error::Config(_))));
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");
        {
            let _db = Database::open(&path).expect("first open should work");
        }
        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_names(db.connection()).len(), 5);
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("old.db");
        {
            let db = Database::open(&path).expect("should open");
            db.connection()
                .execute(
                    "UPDATE spiteflow_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update");
        }
        assert!(matches!(Database::open(&path), Err(Error::Schema(_))));
    }
}
