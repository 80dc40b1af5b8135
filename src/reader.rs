//! # Event Reader
//!
//! Read operations over the event log, as free functions taking a
//! `&Connection`. A `rusqlite::Transaction` derefs to `Connection`, so every
//! function here also runs inside a caller's transaction.
//!
//! ## Reads Are Single Statements
//!
//! Each function issues exactly one `SELECT`. Under WAL a single statement
//! sees one consistent snapshot, so no explicit read transaction is needed.
//!
//! ## Type Filtering
//!
//! [`EventTypes`] filters are pushed into SQL as `type IN (?, ?, ...)` and use
//! the `(type, id)` index. Nothing is filtered in memory.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::types::{AggregateId, Event, EventId, EventTypes, Version};

const EVENT_COLUMNS: &str =
    "id, uuid, aggregate_id, type, body, version, created_at_ms, correlation_id, causation_id";

// =============================================================================
// Row Decoding
// =============================================================================

/// Raw column values, decoded into an [`Event`] outside the rusqlite closure
/// so that JSON and uuid failures surface as our own errors.
struct EventRow {
    id: i64,
    uuid: String,
    aggregate_id: String,
    event_type: String,
    body: String,
    version: i64,
    created_at_ms: i64,
    correlation_id: Option<String>,
    causation_id: Option<String>,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            aggregate_id: row.get(2)?,
            event_type: row.get(3)?,
            body: row.get(4)?,
            version: row.get(5)?,
            created_at_ms: row.get(6)?,
            correlation_id: row.get(7)?,
            causation_id: row.get(8)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: EventId::from_sql(self.id),
            uuid: parse_uuid(self.id, &self.uuid)?,
            aggregate_id: AggregateId::new(self.aggregate_id),
            event_type: self.event_type,
            body: serde_json::from_str(&self.body)?,
            version: Version::from_sql(self.version),
            created_at_ms: u64::try_from(self.created_at_ms).unwrap_or(0),
            correlation_id: self
                .correlation_id
                .map(|s| parse_uuid(self.id, &s))
                .transpose()?,
            causation_id: self
                .causation_id
                .map(|s| parse_uuid(self.id, &s))
                .transpose()?,
        })
    }
}

fn parse_uuid(id: i64, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| Error::Schema(format!("corrupted uuid on event {id}: '{raw}': {e}")))
}

fn query_events(conn: &Connection, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), EventRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(EventRow::into_event).collect()
}

/// Appends ` AND type IN (?, ...)` for a filter, pushing the type params.
fn push_type_filter(sql: &mut String, params: &mut Vec<SqlValue>, types: &EventTypes) {
    if let Some(types) = types.as_slice() {
        let placeholders = vec!["?"; types.len()].join(", ");
        sql.push_str(&format!(" AND type IN ({placeholders})"));
        params.extend(types.iter().cloned().map(SqlValue::Text));
    }
}

fn limit_param(limit: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

// =============================================================================
// Global Log Reads
// =============================================================================

/// Reads events with `id >= from`, ascending, at most `limit`.
///
/// # Example
///
/// ```rust
/// use spiteflow::{reader, Database, EventId, EventTypes};
///
/// let db = Database::open_in_memory()?;
/// let events = reader::read_from(db.connection(), db.tables(), EventId::FIRST, &EventTypes::all(), 10)?;
/// assert!(events.is_empty());
/// # Ok::<(), spiteflow::Error>(())
/// ```
pub fn read_from(
    conn: &Connection,
    tables: &TableNames,
    from: EventId,
    types: &EventTypes,
    limit: usize,
) -> Result<Vec<Event>> {
    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM {} WHERE id >= ?", tables.events);
    let mut params = vec![SqlValue::Integer(from.as_sql())];
    push_type_filter(&mut sql, &mut params, types);
    sql.push_str(" ORDER BY id ASC LIMIT ?");
    params.push(limit_param(limit));
    query_events(conn, &sql, params)
}

/// Returns the highest id matching the filter, or [`EventId::ZERO`].
pub fn latest_id(conn: &Connection, tables: &TableNames, types: &EventTypes) -> Result<EventId> {
    let mut sql = format!("SELECT COALESCE(MAX(id), 0) FROM {} WHERE 1 = 1", tables.events);
    let mut params = Vec::new();
    push_type_filter(&mut sql, &mut params, types);
    let max: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
    Ok(EventId::from_sql(max))
}

/// Visits every event with `from <= id <= to`, in ascending order.
///
/// Reads in pages of `batch_size` via [`read_from`], restarting each page at
/// `last.id + 1`. Stops when a page is empty or the bound is passed. Events
/// above `to` are never visited. An error from `visit` stops the scan and is
/// returned.
///
/// Returns the number of events visited.
pub fn scan_range<F>(
    conn: &Connection,
    tables: &TableNames,
    from: EventId,
    to: EventId,
    types: &EventTypes,
    batch_size: usize,
    mut visit: F,
) -> Result<u64>
where
    F: FnMut(&Event) -> Result<()>,
{
    if batch_size == 0 {
        return Err(Error::InvalidInput("scan batch_size must be at least 1".to_string()));
    }

    let mut cursor = from;
    let mut visited = 0u64;
    while cursor <= to {
        let page = read_from(conn, tables, cursor, types, batch_size)?;
        let Some(last) = page.last() else {
            break;
        };
        let next = last.id.next();
        for event in page.iter().take_while(|e| e.id <= to) {
            visit(event)?;
            visited += 1;
        }
        cursor = next;
    }
    Ok(visited)
}

// =============================================================================
// Aggregate Reads
// =============================================================================

/// Reads the full history of one aggregate, ordered by version.
pub fn read_for_aggregate(
    conn: &Connection,
    tables: &TableNames,
    aggregate_id: &AggregateId,
) -> Result<Vec<Event>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM {} WHERE aggregate_id = ? ORDER BY version ASC",
        tables.events
    );
    query_events(conn, &sql, vec![SqlValue::Text(aggregate_id.as_str().to_string())])
}

/// Returns the aggregate's current version, [`Version::NONE`] if unknown.
pub fn current_version(
    conn: &Connection,
    tables: &TableNames,
    aggregate_id: &AggregateId,
) -> Result<Version> {
    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT version FROM {} WHERE aggregate_id = ?", tables.aggregates),
            params![aggregate_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(Version::from_sql).unwrap_or(Version::NONE))
}

// =============================================================================
// Provenance
// =============================================================================

/// Highest `_driven_by_event_id` stamped on events emitted by `processor`.
///
/// Reads provenance from the JSON bodies with SQLite's `json_extract`, limited
/// to the types the processor may emit. Returns [`EventId::ZERO`] if it never
/// emitted anything.
pub fn max_driven_by(
    conn: &Connection,
    tables: &TableNames,
    processor: &str,
    emitted: &EventTypes,
) -> Result<EventId> {
    let mut sql = format!(
        "SELECT COALESCE(MAX(CAST(json_extract(body, '$._driven_by_event_id') AS INTEGER)), 0) \
         FROM {} WHERE json_extract(body, '$._driven_by_processor') = ?",
        tables.events
    );
    let mut params = vec![SqlValue::Text(processor.to_string())];
    push_type_filter(&mut sql, &mut params, emitted);
    let max: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
    Ok(EventId::from_sql(max))
}

// =============================================================================
// Tests
// =============================================================================
