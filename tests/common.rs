#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use spiteflow::{Database, EventStore, LocalNotifier, NewEvent, StoreConfig, WriteSerialization};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_store(path: &Path) -> EventStore {
    open_store_with(path, WriteSerialization::Transaction)
}

pub fn open_store_with(path: &Path, strategy: WriteSerialization) -> EventStore {
    let config = StoreConfig::default()
        .with_write_serialization(strategy)
        .with_lock_wait(Duration::from_secs(30));
    EventStore::open_with(path, config, Arc::new(LocalNotifier::new())).expect("open store")
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// Appends `n` events of `event_type` to `aggregate`, without a version check.
pub fn append_n(store: &EventStore, aggregate: &str, event_type: &str, n: usize) {
    let events = (0..n)
        .map(|i| NewEvent::new(aggregate, event_type, json!({ "n": i })))
        .collect();
    store.append(events, None).expect("append");
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
