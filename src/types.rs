//! # Domain Types for SpiteFlow
//!
//! This module defines the core types used throughout SpiteFlow: identifiers,
//! positions in the global log, per-aggregate versions and the event records
//! themselves.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! As everywhere in this crate, primitives are wrapped in single-field structs:
//!
//! - An [`EventId`] can never be passed where a [`Version`] is expected
//! - Signatures document themselves: `read_from(conn, EventId, ..)`
//! - The database representation (`i64`) stays an implementation detail
//!
//! ## Invariants
//!
//! - [`EventId`]: Strictly increasing, never reused. `0` is the "before the
//!   first event" sentinel used by fresh checkpoints.
//! - [`Version`]: Per aggregate, starts at 1, no gaps. `0` means "no events".
//! - For every aggregate, `aggregates.version` equals its committed event count.

use std::fmt;

use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Aggregate Identification
// =============================================================================

/// Identifier of the aggregate (entity) an event belongs to.
///
/// # Example
///
/// ```rust
/// use spiteflow::AggregateId;
///
/// let id = AggregateId::new("order-42");
/// assert_eq!(id.as_str(), "order-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateId(String);

impl AggregateId {
    /// Creates a new aggregate ID.
    ///
    /// # Rust Pattern: impl Into<String>
    ///
    /// Callers may pass `&str` or `String`; the conversion happens here once.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this aggregate ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Positions and Versions
// =============================================================================

/// Position of an event in the global log.
///
/// Assigned by the database (`INTEGER PRIMARY KEY AUTOINCREMENT`), so ids of
/// deleted rows are never handed out again.
///
/// # Rust Pattern: Copy
///
/// 8 bytes and passed around constantly, so it is `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(u64);

impl EventId {
    /// Sentinel meaning "before the first event". Fresh checkpoints start here.
    pub const ZERO: EventId = EventId(0);

    /// The first id SQLite hands out.
    pub const FIRST: EventId = EventId(1);

    /// Creates an EventId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the value in SQLite's INTEGER representation.
    ///
    /// Values above `i64::MAX` clamp; SQLite never allocates them.
    pub fn as_sql(&self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Creates an EventId from a SQLite INTEGER. Negative values become zero.
    pub fn from_sql(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }

    /// Returns the next id.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns true for the sentinel zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of an aggregate: the number of events committed for it.
///
/// # Relationship to EventId
///
/// - `EventId`: position in the total order across ALL aggregates
/// - `Version`: position within a SINGLE aggregate
///
/// "Event 1000 is version 5 of order-42."
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(u64);

impl Version {
    /// No events yet.
    pub const NONE: Version = Version(0);

    /// Version of an aggregate's first event.
    pub const FIRST: Version = Version(1);

    /// Creates a Version from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the version in SQLite's INTEGER representation.
    pub fn as_sql(&self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Creates a Version from a SQLite INTEGER.
    pub fn from_sql(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds an offset to this version.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Returns true if this represents "no events".
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Type Filters
// =============================================================================

/// Optional event type filter for reads and subscriptions.
///
/// The filter is pushed into the SQL query (`type IN (...)`), never applied in
/// memory after the fact.
///
/// An empty list means "everything", matching how processors declare that
/// they consume all types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTypes(Option<Vec<String>>);

impl EventTypes {
    /// Matches every event type.
    pub fn all() -> Self {
        Self(None)
    }

    /// Matches only the listed types. An empty list matches everything.
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut types: Vec<String> = types.into_iter().map(Into::into).collect();
        if types.is_empty() {
            return Self(None);
        }
        types.sort();
        types.dedup();
        Self(Some(types))
    }

    /// Returns true if no filtering applies.
    pub fn is_all(&self) -> bool {
        self.0.is_none()
    }

    /// The listed types, or `None` for "all".
    pub fn as_slice(&self) -> Option<&[String]> {
        self.0.as_deref()
    }

    /// Returns true if an event of `event_type` passes the filter.
    pub fn matches(&self, event_type: &str) -> bool {
        match &self.0 {
            None => true,
            Some(types) => types.iter().any(|t| t == event_type),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event to be appended.
///
/// This is the "input" form: it has no id or version yet, those are assigned
/// by the append protocol.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use spiteflow::NewEvent;
///
/// let event = NewEvent::new("user-1", "terms_accepted", json!({"at": 1}));
/// assert_eq!(event.event_type, "terms_accepted");
/// ```
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Globally unique id of this event. Generated unless supplied.
    pub uuid: Uuid,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The event type, used for filtering and routing.
    pub event_type: String,

    /// JSON payload.
    pub body: Value,

    /// Id shared by every event in one logical workflow.
    pub correlation_id: Option<Uuid>,

    /// Uuid of the event that caused this one.
    pub causation_id: Option<Uuid>,
}

impl NewEvent {
    /// Creates a new event with a fresh uuid and no correlation metadata.
    pub fn new(
        aggregate_id: impl Into<AggregateId>,
        event_type: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            body,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Overrides the generated uuid (builder pattern).
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Sets the correlation id (builder pattern).
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id (builder pattern).
    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// A stored event.
///
/// The "output" form, immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Position in the global log.
    pub id: EventId,

    /// Globally unique id.
    pub uuid: Uuid,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The event type.
    pub event_type: String,

    /// JSON payload.
    pub body: Value,

    /// Version within the aggregate.
    pub version: Version,

    /// When the event was stored (Unix milliseconds).
    pub created_at_ms: u64,

    /// Workflow correlation id, if any.
    pub correlation_id: Option<Uuid>,

    /// Uuid of the causing event, if any.
    pub causation_id: Option<Uuid>,
}

// =============================================================================
// Results
// =============================================================================

/// The result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// The aggregate that was written.
    pub aggregate_id: AggregateId,

    /// Ids assigned to the appended events, in append order.
    pub event_ids: Vec<EventId>,

    /// Version of the first appended event.
    pub first_version: Version,

    /// Version of the last appended event (the aggregate's new version).
    pub last_version: Version,
}

impl AppendResult {
    /// The highest id assigned by this append.
    pub fn last_id(&self) -> EventId {
        self.event_ids.last().copied().unwrap_or(EventId::ZERO)
    }

    /// Returns the number of events that were appended.
    pub fn event_count(&self) -> usize {
        self.event_ids.len()
    }
}

// =============================================================================
// Time
// =============================================================================

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
