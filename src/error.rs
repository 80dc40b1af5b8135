//! # Error Handling for SpiteFlow
//!
//! One error enum ([`Error`]) covers every failure mode in the engine: the
//! store, the checkpoint tracker, the subscription engine, the processor
//! runtime and the supervisor all return [`Result<T>`].
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `std::error::Error` and `Display` from the
//! `#[error(...)]` attributes, generates `From` impls for `#[from]` fields and
//! wires `source()` for `#[source]` fields, so `?` converts `rusqlite` and
//! `serde_json` errors for free.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | `Concurrency` | Caller reloads the aggregate and retries the business operation |
//! | Programming | `MultiAggregateWrite`, `UndeclaredEventEmission`, `Config` | Fatal, fix the code |
//! | Startup | `UnableToLockProcessor` | Fatal, another instance is live |
//! | Processing | `EventProcessing` | Supervisor applies the retry policy |
//! | Internal | `Sqlite`, `Json`, `Schema`, `Runtime` | Log and investigate |
//!
//! Only the supervisor catches runtime-loop errors. Everything that reaches it
//! is logged with the processor name and the full cause chain
//! (see [`Error::chain`]) before any retry.

use thiserror::Error;

use crate::types::{AggregateId, EventId, Version};

/// Boxed error returned by user-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteFlow operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors
    // =========================================================================

    /// Optimistic concurrency conflict: the aggregate moved on since the caller
    /// last loaded it.
    ///
    /// # Recovery
    ///
    /// The framework never retries this. The caller reloads the aggregate,
    /// re-runs its business logic and appends again with the fresh version.
    #[error("concurrency conflict on aggregate '{aggregate_id}': expected version {expected}, but found {actual}")]
    Concurrency {
        /// The aggregate the append targeted
        aggregate_id: AggregateId,
        /// The version the caller expected
        expected: Version,
        /// The version actually stored
        actual: Version,
    },

    // =========================================================================
    // Programming Errors (fatal, never retried)
    // =========================================================================

    /// A single `append` call mixed events for more than one aggregate.
    #[error("multi-aggregate write not supported: batch targets '{first}' and '{other}'")]
    MultiAggregateWrite {
        /// Aggregate of the first event in the batch
        first: AggregateId,
        /// The first aggregate that differed from it
        other: AggregateId,
    },

    /// A reactor emitted an event type it never declared.
    #[error("processor '{processor}' emitted undeclared event type '{event_type}'")]
    UndeclaredEventEmission {
        /// The reactor name
        processor: String,
        /// The offending event type
        event_type: String,
    },

    /// Invalid configuration (bad table name, zero batch size, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid caller input (empty append, non-object emission body, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // Locking
    // =========================================================================

    /// Another live instance holds the processor's exclusive lock.
    #[error("unable to lock processor '{name}': another instance holds the lock")]
    UnableToLockProcessor {
        /// The processor name
        name: String,
    },

    /// The write-serialization lock could not be acquired in time.
    #[error("timed out waiting for cooperative lock {key}")]
    LockTimeout {
        /// The lock key
        key: i64,
    },

    // =========================================================================
    // Processing
    // =========================================================================

    /// A processor failed while handling one event.
    ///
    /// Carries the offending event id so the supervisor can scope its backoff
    /// to that event.
    #[error("processor '{processor}' failed on event {event_id}")]
    EventProcessing {
        /// The processor name
        processor: String,
        /// The event being processed when the failure happened
        event_id: EventId,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// Error raised by user handler code.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),

    /// Body could not be converted to or from a typed event.
    #[error("codec error: {0}")]
    Codec(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch or corrupted rows.
    #[error("schema error: {0}")]
    Schema(String),

    /// Thread, runtime or channel failure inside the engine.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Wraps an arbitrary handler error.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Error::Handler(err.into())
    }

    /// Returns true if retrying can never help.
    ///
    /// Fatal errors end a supervised processor regardless of its retry policy.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::UnableToLockProcessor { .. }
            | Error::UndeclaredEventEmission { .. }
            | Error::MultiAggregateWrite { .. }
            | Error::Config(_) => true,
            Error::EventProcessing { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The event a processing failure is attributed to, if any.
    pub fn offending_event(&self) -> Option<EventId> {
        match self {
            Error::EventProcessing { event_id, .. } => Some(*event_id),
            _ => None,
        }
    }

    /// Renders the error and every `source()` below it as one line.
    ///
    /// ```rust
    /// use spiteflow::{Error, EventId};
    ///
    /// let err = Error::EventProcessing {
    ///     processor: "emails".to_string(),
    ///     event_id: EventId::from_raw(7),
    ///     source: Box::new(Error::Runtime("smtp down".to_string())),
    /// };
    /// assert_eq!(
    ///     err.chain(),
    ///     "processor 'emails' failed on event 7: runtime error: smtp down"
    /// );
    /// ```
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            current = cause.source();
        }
        rendered
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
