//! # Stream Processors
//!
//! A stream processor consumes the event log in order and keeps a persistent
//! checkpoint of how far it got. Two strategies ship with the crate:
//!
//! | Strategy | Side effect | Atomic with the checkpoint |
//! |----------|-------------|----------------------------|
//! | [`Projector`] | Writes to its own read-model tables | Yes, same transaction |
//! | [`Reactor`] | Emits new events into the store | Yes, plus an idempotency cursor |
//!
//! ## Configuration Is Data
//!
//! A processor declares itself with a [`ProcessorSpec`]: its name, the event
//! types it consumes, the types it may emit and the tables it owns. The
//! runtime reads the declaration; nothing is discovered by reflection.
//!
//! ```rust
//! use spiteflow::processor::ProcessorSpec;
//!
//! let spec = ProcessorSpec::new("user_emails")
//!     .processes(["user_registered", "email_changed"])
//!     .table(
//!         "user_emails",
//!         "CREATE TABLE IF NOT EXISTS user_emails (user_id TEXT PRIMARY KEY, email TEXT NOT NULL)",
//!     );
//! assert_eq!(spec.name, "user_emails");
//! ```

mod projector;
mod reactor;
mod runtime;

pub use projector::{Projection, Projector};
pub use reactor::{Emitter, Reaction, Reactor, DRIVEN_BY_EVENT_ID, DRIVEN_BY_PROCESSOR};
pub use runtime::{EventStreamProcessor, ProcessingStrategy, ProcessorContext};

use crate::config::validate_identifier;
use crate::error::{Error, Result};
use crate::types::EventTypes;

/// A table owned by a processor: created at setup, dropped on reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name, dropped verbatim on reset.
    pub name: String,
    /// DDL run at setup. Should be idempotent (`IF NOT EXISTS`).
    pub create_sql: String,
}

/// Declarative description of a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSpec {
    /// Unique processor name; keys the checkpoint row.
    pub name: String,
    /// Consumed event types. Empty means all.
    pub processes: Vec<String>,
    /// Event types the processor may emit.
    pub emits: Vec<String>,
    /// Tables the processor owns.
    pub tables: Vec<TableSchema>,
}

impl ProcessorSpec {
    /// Creates a declaration that consumes everything and emits nothing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processes: Vec::new(),
            emits: Vec::new(),
            tables: Vec::new(),
        }
    }

    /// Sets the consumed types.
    pub fn processes<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.processes = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the emitted types.
    pub fn emits<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emits = types.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an owned table.
    pub fn table(mut self, name: impl Into<String>, create_sql: impl Into<String>) -> Self {
        self.tables.push(TableSchema {
            name: name.into(),
            create_sql: create_sql.into(),
        });
        self
    }

    /// The consumed types as a query filter.
    pub fn consumed(&self) -> EventTypes {
        EventTypes::only(self.processes.iter().cloned())
    }

    /// Whether `event_type` was declared in `emits`.
    pub fn may_emit(&self, event_type: &str) -> bool {
        self.emits.iter().any(|t| t == event_type)
    }

    /// Checks the name and owned table names.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("processor name must not be empty".to_string()));
        }
        for table in &self.tables {
            validate_identifier(&table.name)?;
        }
        Ok(())
    }
}
