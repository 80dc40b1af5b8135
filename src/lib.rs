//! # SpiteFlow - Event Store and Stream Processor Runtime
//!
//! SpiteFlow is an event-sourcing engine built on SQLite. It provides:
//!
//! - **An append-only event log**: global ids, per-aggregate versions, optimistic concurrency
//! - **Gap-free tailing**: writers serialize so commit order always matches id order
//! - **Projectors**: read models updated in the same transaction as their checkpoint
//! - **Reactors**: side-effect processors that emit new events exactly once per source
//! - **Supervision**: per-processor threads, retry with backoff, cooperative shutdown
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Supervisor                             │
//! │        (thread + current-thread runtime per processor)          │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  Projector  │  │   Reactor   │  │   Retry / Backoff       │  │
//! │  │ (view + cp) │  │ (emit + cp) │  │   SIGINT / SIGTERM      │  │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────────────────┘  │
//! └─────────┼────────────────┼──────────────────────────────────────┘
//!           │   Subscription (Idle ─► Poll ─► Deliver)
//!           ▼                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   EventStore (append, read)  ──publish──►  ChangeNotifier       │
//! │   CheckpointTracker (cursors, cooperative locks)                │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! │   events · aggregates · processor_checkpoints · locks           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Ordered log**: event ids strictly increase and are never reused
//! 2. **No overtaking commits**: an id is visible only after every smaller id is
//! 3. **Aggregate correctness**: versions per aggregate are 1, 2, 3, ... with no gaps
//! 4. **Atomic projection**: a view and its checkpoint commit together or not at all
//! 5. **Once-only emission**: a reactor never emits twice for the same source event
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use spiteflow::{EventStore, NewEvent, Version};
//!
//! let store = EventStore::open("app.db")?;
//! let result = store.append(
//!     vec![NewEvent::new("order-1", "order_placed", json!({ "total": 10 }))],
//!     Some(Version::NONE),
//! )?;
//! assert_eq!(result.last_version, Version::FIRST);
//! # Ok::<(), spiteflow::Error>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SpiteFlow operations.
///
/// One enum covers storage, concurrency, configuration and handler failures.
/// [`Error::is_fatal`] tells the supervisor which ones are not worth retrying.
pub mod error;

/// Domain types: ids, versions, events and type filters.
///
/// Uses the newtype pattern so an [`EventId`] can never be passed where a
/// [`Version`] is expected.
pub mod types;

/// Store, processor and supervisor configuration.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Read operations over a connection.
///
/// Free functions over `&Connection`, so they work on a plain connection,
/// inside a transaction, or through [`EventStore`].
pub mod reader;

/// Cooperative locks stored in the locks table.
pub mod lock;

/// The event store: append with optimistic concurrency, plus reads.
///
/// The main entry point is [`EventStore`].
pub mod store;

/// Change notification between writers and subscribers.
///
/// Notifications are hints. Subscribers always re-read the log, so a lost or
/// coalesced pulse costs latency, never events.
pub mod notifier;

/// Subscriptions: catch-up then tail, delivering batches in id order.
pub mod subscription;

/// Per-processor checkpoints and processor locks.
pub mod checkpoint;

/// Typed event bodies over serde.
pub mod codec;

/// Projectors, reactors and the shared processing loop.
pub mod processor;

/// Running processors with retries and cooperative shutdown.
pub mod supervisor;

// =============================================================================
// Re-exports
// =============================================================================

pub use checkpoint::{CheckpointTracker, ProcessorLock};
pub use codec::EventBody;
pub use config::{
    LockMode, ProcessorConfig, RetryPolicy, StoreConfig, SupervisorConfig, TableNames,
    WriteSerialization,
};
pub use error::{Error, Result};
pub use notifier::{ChangeNotifier, CompositeNotifier, LocalNotifier, PollingNotifier};
pub use processor::{Emitter, EventStreamProcessor, ProcessorSpec, Projector, Reactor};
pub use schema::Database;
pub use store::EventStore;
pub use subscription::{Sink, Subscription, SubscriptionState};
pub use supervisor::{ShutdownHandle, Supervised, Supervisor, UnitExit, UnitOutcome};
pub use types::{AggregateId, AppendResult, Event, EventId, EventTypes, NewEvent, Version};
