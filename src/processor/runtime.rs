//! The generic processing loop shared by every strategy.
//!
//! ```text
//! Setup ──► Subscribe(checkpoint + 1, spec.processes) ──► for each event:
//!   │                                                       handle (process + advance)
//!   └── checkpoint row, processor lock, owned tables
//!
//! Reset: drop owned tables + zero checkpoint (one tx) ──► re-create tables
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ProcessorSpec;
use crate::checkpoint::{CheckpointTracker, ProcessorLock};
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::subscription::{Sink, Subscription};
use crate::types::{Event, EventId};

// =============================================================================
// Strategy Seam
// =============================================================================

/// What a processor does with each event.
///
/// `handle` must process the event *and* advance the checkpoint to
/// `event.id`, atomically where the strategy allows it.
pub trait ProcessingStrategy: Send {
    /// The processor declaration.
    fn spec(&self) -> &ProcessorSpec;

    /// Runs once per start, after setup and before the first event.
    fn prepare(&mut self, _ctx: &ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Processes one event and advances the checkpoint.
    fn handle(&mut self, ctx: &ProcessorContext, event: &Event) -> Result<()>;
}

/// Handles a strategy gets to the store and its checkpoint.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    /// The processor's own store handle.
    pub store: Arc<EventStore>,
    /// The processor's checkpoint tracker.
    pub tracker: CheckpointTracker,
    /// The processor name.
    pub name: String,
}

// =============================================================================
// Runtime
// =============================================================================

/// A strategy bound to a store, a checkpoint and a subscription.
pub struct EventStreamProcessor<S: ProcessingStrategy> {
    strategy: S,
    config: ProcessorConfig,
    ctx: ProcessorContext,
    lock: Option<ProcessorLock>,
}

impl<S: ProcessingStrategy> std::fmt::Debug for EventStreamProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamProcessor")
            .field("name", &self.ctx.name)
            .field("set_up", &self.lock.is_some())
            .finish()
    }
}

impl<S: ProcessingStrategy> EventStreamProcessor<S> {
    /// Binds `strategy` to its own connection on `store`'s database.
    pub fn new(store: &EventStore, strategy: S, config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        strategy.spec().validate()?;
        let store = Arc::new(store.try_clone()?);
        let tracker = CheckpointTracker::new(Arc::clone(&store), config.lock_mode, config.lock_stale_after);
        let name = strategy.spec().name.clone();
        Ok(Self {
            strategy,
            config,
            ctx: ProcessorContext { store, tracker, name },
            lock: None,
        })
    }

    /// The processor name.
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// The strategy, e.g. to inspect handler state in tests.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The checkpoint tracker.
    pub fn tracker(&self) -> &CheckpointTracker {
        &self.ctx.tracker
    }

    /// The processor's store handle.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.ctx.store
    }

    /// Creates the checkpoint, takes the lock and creates owned tables.
    ///
    /// Calling it again after a successful setup only re-verifies the lock, so
    /// a restart after the lock went stale and was taken over fails with
    /// `Error::UnableToLockProcessor` instead of processing.
    pub fn setup(&mut self) -> Result<()> {
        if let Some(lock) = &self.lock {
            return lock.heartbeat();
        }
        let lock = self.ctx.tracker.setup(&self.ctx.name)?;
        self.create_tables()?;
        self.lock = Some(lock);
        Ok(())
    }

    fn create_tables(&self) -> Result<()> {
        let tables = &self.strategy.spec().tables;
        if tables.is_empty() {
            return Ok(());
        }
        self.ctx.store.transaction(|tx| {
            for table in tables {
                tx.execute_batch(&table.create_sql)?;
            }
            Ok(())
        })
    }

    /// Drops owned tables and zeroes the checkpoint, then re-creates tables.
    ///
    /// The actioned cursor survives, so a reactor replaying from zero emits
    /// nothing twice.
    pub fn reset(&mut self) -> Result<()> {
        self.setup()?;
        let name = self.ctx.name.clone();
        let tracker = self.ctx.tracker.clone();
        let tables = &self.strategy.spec().tables;
        self.ctx.store.transaction(|tx| {
            for table in tables {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.name))?;
            }
            tracker.record_processed_in(tx, &name, EventId::ZERO)
        })?;
        self.create_tables()?;
        info!(processor = %name, "processor reset");
        Ok(())
    }

    fn start(&mut self) -> Result<EventId> {
        self.setup()?;
        self.strategy.prepare(&self.ctx)?;
        self.ctx.tracker.last_processed(&self.ctx.name)
    }

    fn subscribe(&self, from: EventId, shutdown: watch::Receiver<bool>) -> Result<Subscription> {
        Subscription::new(
            Arc::clone(&self.ctx.store),
            from,
            self.strategy.spec().consumed(),
            &self.config,
            shutdown,
        )
    }

    /// Processes everything currently in the log, then returns.
    ///
    /// Returns the number of events handled. Must be called inside a tokio
    /// runtime.
    pub fn catch_up(&mut self) -> Result<u64> {
        let from = self.start()?;
        // A never-signalled sender: catch-up does not wait, so nothing listens.
        let (_tx, rx) = watch::channel(false);
        let mut subscription = self.subscribe(from, rx)?;
        let mut sink = self.sink();
        subscription.catch_up(&mut sink)
    }

    /// Processes the log and then tails it until shutdown is requested.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let from = self.start()?;
        info!(processor = %self.ctx.name, from = %from, "processor subscribed");
        let mut subscription = self.subscribe(from, shutdown)?;
        let mut sink = self.sink();
        subscription.run(&mut sink).await
    }

    fn sink(&mut self) -> ProcessorSink<'_, S> {
        ProcessorSink {
            strategy: &mut self.strategy,
            ctx: &self.ctx,
            lock: self.lock.as_ref(),
            heartbeat_every: self.config.heartbeat_interval,
            last_heartbeat: Instant::now(),
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

struct ProcessorSink<'a, S> {
    strategy: &'a mut S,
    ctx: &'a ProcessorContext,
    lock: Option<&'a ProcessorLock>,
    heartbeat_every: std::time::Duration,
    last_heartbeat: Instant,
}

impl<S> ProcessorSink<'_, S> {
    fn heartbeat_if_due(&mut self) -> Result<()> {
        if self.last_heartbeat.elapsed() < self.heartbeat_every {
            return Ok(());
        }
        if let Some(lock) = self.lock {
            lock.heartbeat()?;
        }
        self.last_heartbeat = Instant::now();
        Ok(())
    }
}

impl<S: ProcessingStrategy> Sink for ProcessorSink<'_, S> {
    fn deliver(&mut self, batch: &[Event]) -> Result<()> {
        for event in batch {
            if let Err(source) = self.strategy.handle(self.ctx, event) {
                warn!(
                    processor = %self.ctx.name,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %source,
                    "event processing failed"
                );
                return Err(Error::EventProcessing {
                    processor: self.ctx.name.clone(),
                    event_id: event.id,
                    source: Box::new(source),
                });
            }
            debug!(processor = %self.ctx.name, event_id = %event.id, "event processed");
        }
        self.heartbeat_if_due()
    }

    fn on_idle(&mut self) -> Result<()> {
        self.heartbeat_if_due()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockMode, StoreConfig};
    use crate::notifier::LocalNotifier;
    use crate::types::NewEvent;
    use serde_json::json;
    use std::time::Duration;

    /// Records ids and advances the checkpoint, failing on one chosen id.
    struct Recorder {
        spec: ProcessorSpec,
        seen: Vec<u64>,
        fail_on: Option<u64>,
        prepared: usize,
    }

    impl ProcessingStrategy for Recorder {
        fn spec(&self) -> &ProcessorSpec {
            &self.spec
        }

        fn prepare(&mut self, _ctx: &ProcessorContext) -> Result<()> {
            self.prepared += 1;
            Ok(())
        }

        fn handle(&mut self, ctx: &ProcessorContext, event: &Event) -> Result<()> {
            if self.fail_on == Some(event.id.as_raw()) {
                return Err(Error::Runtime("refusing".to_string()));
            }
            self.seen.push(event.id.as_raw());
            ctx.tracker.record_processed(&ctx.name, event.id)
        }
    }

    fn recorder(fail_on: Option<u64>) -> Recorder {
        Recorder {
            spec: ProcessorSpec::new("recorder").processes(["tick"]),
            seen: Vec::new(),
            fail_on,
            prepared: 0,
        }
    }

    fn temp_store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = EventStore::open_with(
            dir.path().join("runtime.db"),
            StoreConfig::default(),
            Arc::new(LocalNotifier::new()),
        )
        .expect("should open store");
        (dir, store)
    }

    fn ticks(store: &EventStore, n: usize) {
        let events = (0..n).map(|i| NewEvent::new("clock", "tick", json!({ "i": i }))).collect();
        store.append(events, None).unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_processes_only_consumed_types() {
        let (_dir, store) = temp_store();
        ticks(&store, 2);
        store
            .append(vec![NewEvent::new("other", "tock", json!({}))], None)
            .unwrap();
        ticks(&store, 1);

        let mut processor = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        assert_eq!(processor.catch_up().unwrap(), 3);
        assert_eq!(processor.strategy().seen, vec![1, 2, 4]);
        assert_eq!(processor.tracker().last_processed("recorder").unwrap(), EventId::from_raw(4));
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_with_event_id() {
        let (_dir, store) = temp_store();
        ticks(&store, 3);
        let mut processor = EventStreamProcessor::new(&store, recorder(Some(2)), ProcessorConfig::default()).unwrap();

        let err = processor.catch_up().unwrap_err();
        assert_eq!(err.offending_event(), Some(EventId::from_raw(2)));
        assert!(matches!(err, Error::EventProcessing { ref processor, .. } if processor == "recorder"));
        assert_eq!(processor.tracker().last_processed("recorder").unwrap(), EventId::FIRST);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let (_dir, store) = temp_store();
        ticks(&store, 2);
        {
            let mut first = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
            first.catch_up().unwrap();
        }
        ticks(&store, 1);
        let mut second = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        second.catch_up().unwrap();
        assert_eq!(second.strategy().seen, vec![3]);
    }

    #[tokio::test]
    async fn test_second_instance_is_locked_out() {
        let (_dir, store) = temp_store();
        let mut first = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        first.setup().unwrap();

        let mut second = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        let err = second.catch_up().unwrap_err();
        assert!(matches!(err, Error::UnableToLockProcessor { .. }));
        assert!(err.is_fatal());

        let skipping = ProcessorConfig::default().with_lock_mode(LockMode::Skip);
        let mut third = EventStreamProcessor::new(&store, recorder(None), skipping).unwrap();
        third.catch_up().expect("skip mode should not lock");
    }

    #[tokio::test]
    async fn test_taken_over_lock_stops_processing_on_restart() {
        let (_dir, store) = temp_store();
        let mut first = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        first.setup().unwrap();

        // The first instance stops heartbeating; a second one takes over.
        store
            .with_connection(|conn| {
                conn.execute("UPDATE cooperative_locks SET heartbeat_at_ms = 0", [])?;
                Ok(())
            })
            .unwrap();
        let mut second = EventStreamProcessor::new(&store, recorder(None), ProcessorConfig::default()).unwrap();
        second.setup().unwrap();

        ticks(&store, 1);
        let err = first.catch_up().unwrap_err();
        assert!(matches!(err, Error::UnableToLockProcessor { .. }));
        assert!(err.is_fatal());
        assert!(first.strategy().seen.is_empty());
        assert_eq!(first.tracker().last_processed("recorder").unwrap(), EventId::ZERO);

        assert_eq!(second.catch_up().unwrap(), 1);
        assert_eq!(second.strategy().seen, vec![1]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, store) = temp_store();
        ticks(&store, 2);
        let config = ProcessorConfig::default().with_wait_timeout(Duration::from_millis(20));
        let mut processor = EventStreamProcessor::new(&store, recorder(None), config).unwrap();

        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
        });
        tokio::time::timeout(Duration::from_secs(5), processor.run(rx))
            .await
            .expect("run should stop")
            .unwrap();
        stopper.await.unwrap();

        assert_eq!(processor.strategy().seen, vec![1, 2]);
        assert_eq!(processor.strategy().prepared, 1);
    }
}
