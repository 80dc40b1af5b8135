//! # Configuration
//!
//! Plain structs with `Default` impls and `with_*` builders. Nothing here reads
//! the environment or files; embedders construct these directly.
//!
//! | Struct | Used by | Controls |
//! |--------|---------|----------|
//! | [`StoreConfig`] | `EventStore`, schema | Table names, write serialization, lock and busy timeouts |
//! | [`ProcessorConfig`] | `EventStreamProcessor`, `Subscription` | Batch size, idle wait, processor locking |
//! | [`SupervisorConfig`] | `Supervisor` | Retry policy |

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default SQLite busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default wait for the write-serialization lock in milliseconds.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;

/// Default number of events fetched per subscription query.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default bound on one idle wait, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1_000;

/// Default age after which a processor lock heartbeat is considered dead.
pub const DEFAULT_LOCK_STALE_AFTER_MS: u64 = 30_000;

/// Default interval between processor lock heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

const MAX_IDENTIFIER_LEN: usize = 64;

// =============================================================================
// Table Names
// =============================================================================

/// Names of the tables SpiteFlow owns.
///
/// Table names are interpolated into SQL, so every name is validated as a
/// plain identifier (`[A-Za-z_][A-Za-z0-9_]*`) before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// The event log.
    pub events: String,
    /// Per-aggregate version records.
    pub aggregates: String,
    /// Processor checkpoints.
    pub checkpoints: String,
    /// Cooperative lock records.
    pub locks: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            events: "events".to_string(),
            aggregates: "aggregates".to_string(),
            checkpoints: "processor_checkpoints".to_string(),
            locks: "cooperative_locks".to_string(),
        }
    }
}

impl TableNames {
    /// Prefixes every table name, e.g. `with_prefix("billing_")`.
    pub fn with_prefix(prefix: &str) -> Self {
        let base = Self::default();
        Self {
            events: format!("{prefix}{}", base.events),
            aggregates: format!("{prefix}{}", base.aggregates),
            checkpoints: format!("{prefix}{}", base.checkpoints),
            locks: format!("{prefix}{}", base.locks),
        }
    }

    /// Checks every name is a safe SQL identifier and names are distinct.
    pub fn validate(&self) -> Result<()> {
        let names = [&self.events, &self.aggregates, &self.checkpoints, &self.locks];
        for name in names {
            validate_identifier(name)?;
        }
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].contains(a) {
                return Err(Error::Config(format!("table name '{a}' used twice")));
            }
        }
        Ok(())
    }
}

/// Validates a SQL identifier that will be interpolated into statements.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!("invalid SQL identifier '{name}'")));
    }
    Ok(())
}

// =============================================================================
// Store Configuration
// =============================================================================

/// How concurrent appends are serialized so that commit order matches id
/// order.
///
/// ```text
/// writer A: BEGIN ── id 7 ──────────────── COMMIT
/// writer B:      BEGIN ── id 8 ── COMMIT            <- reader at 6 sees 8, skips 7
/// ```
///
/// Every strategy rules the interleaving above out; they differ only in which
/// lock does it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteSerialization {
    /// `BEGIN IMMEDIATE`: SQLite's single writer lock serializes appends.
    #[default]
    Transaction,
    /// `BEGIN EXCLUSIVE`: readers on rollback-journal databases are blocked too.
    ExclusiveLock,
    /// Hold the cooperative write lock for the whole append transaction.
    AdvisoryLock,
}

/// Configuration for an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Table names.
    pub tables: TableNames,
    /// Write serialization strategy.
    pub write_serialization: WriteSerialization,
    /// How long an append waits for the cooperative write lock.
    pub lock_wait: Duration,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tables: TableNames::default(),
            write_serialization: WriteSerialization::default(),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl StoreConfig {
    /// Sets the table names.
    pub fn with_tables(mut self, tables: TableNames) -> Self {
        self.tables = tables;
        self
    }

    /// Sets the write serialization strategy.
    pub fn with_write_serialization(mut self, strategy: WriteSerialization) -> Self {
        self.write_serialization = strategy;
        self
    }

    /// Sets the cooperative write lock wait.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Sets the SQLite busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Validates table names.
    pub fn validate(&self) -> Result<()> {
        self.tables.validate()
    }
}

// =============================================================================
// Processor Configuration
// =============================================================================

/// Whether a processor takes its exclusive lock during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Acquire the lock; fail setup if another live instance holds it.
    #[default]
    Exclusive,
    /// Skip locking. Only safe when the caller guarantees a single instance.
    Skip,
}

/// Configuration for one stream processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum events per store query.
    pub batch_size: usize,
    /// Upper bound on one idle wait before shutdown is rechecked.
    pub wait_timeout: Duration,
    /// Locking behaviour at setup.
    pub lock_mode: LockMode,
    /// Age after which another instance may take over the lock.
    pub lock_stale_after: Duration,
    /// How often a running processor refreshes its lock.
    pub heartbeat_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            lock_mode: LockMode::default(),
            lock_stale_after: Duration::from_millis(DEFAULT_LOCK_STALE_AFTER_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }
}

impl ProcessorConfig {
    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the idle wait bound.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Sets the lock mode.
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Sets the stale-lock takeover age.
    pub fn with_lock_stale_after(mut self, age: Duration) -> Self {
        self.lock_stale_after = age;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.wait_timeout.is_zero() {
            return Err(Error::Config("wait_timeout must be non-zero".to_string()));
        }
        if self.heartbeat_interval >= self.lock_stale_after {
            return Err(Error::Config(
                "heartbeat_interval must be shorter than lock_stale_after".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Supervisor Configuration
// =============================================================================

/// What the supervisor does after a processor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Terminate the processor.
    #[default]
    None,
    /// Sleep a fixed delay, then resume from the checkpoint.
    Constant {
        /// Delay between attempts.
        delay: Duration,
    },
    /// Double the delay after each failure on the same event, up to `max`.
    ///
    /// The delay resets to `base` when a different event fails.
    Exponential {
        /// First delay.
        base: Duration,
        /// Ceiling.
        max: Duration,
    },
}

/// Configuration for the [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Retry policy applied to every supervised processor.
    pub retry: RetryPolicy,
}

impl SupervisorConfig {
    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
