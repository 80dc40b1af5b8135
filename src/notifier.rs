//! # Change Notification
//!
//! A change notifier tells subscribers "something was appended, re-query".
//! Pulses carry no event data; the store remains the only source of truth.
//!
//! ## Pulse Flow
//!
//! ```text
//!   EventStore::append ── commit ──► publish(last_id)
//!                                         │
//!                   ┌─────────────────────┴───────────────┐
//!                   ▼                                     ▼
//!          listener task (sub A)                 listener task (sub B)
//!                   │ try_send(())                        │
//!                   ▼                                     ▼
//!          ┌─────────────────┐                   ┌─────────────────┐
//!          │ queue (cap = 1) │                   │ queue (cap = 1) │
//!          └────────┬────────┘                   └────────┬────────┘
//!                   ▼                                     ▼
//!             WakeReceiver                          WakeReceiver
//! ```
//!
//! The listener task is the only thing that waits on the source. It forwards
//! into a capacity-1 queue with `try_send`, so a pulse arriving while one is
//! pending is dropped: any number of appends between two polls cost exactly
//! one wake-up.
//!
//! ## Implementations
//!
//! - [`LocalNotifier`]: push, via a `tokio::sync::broadcast` channel shared by
//!   every store handle in the process
//! - [`PollingNotifier`]: a timer, for writers in other processes
//! - [`CompositeNotifier`]: any combination of the above

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::EventId;

/// Capacity of the in-process broadcast channel. Lagging listeners still pulse.
const BROADCAST_CAPACITY: usize = 64;

// =============================================================================
// Wake Queue
// =============================================================================

/// Sending half of a subscriber's wake queue, handed to listener tasks.
#[derive(Debug, Clone)]
pub struct Pulse {
    tx: mpsc::Sender<()>,
}

impl Pulse {
    /// Enqueues a pulse unless one is already pending.
    ///
    /// Returns `false` once the receiver is gone, telling the listener to exit.
    pub fn send(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Receiving end of a subscription's deduplicating wake queue.
///
/// Dropping it aborts every listener task feeding it.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<()>,
    tx: mpsc::Sender<()>,
    listeners: Vec<JoinHandle<()>>,
}

impl Default for WakeReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeReceiver {
    /// Creates an empty queue with no listeners attached.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            tx,
            listeners: Vec::new(),
        }
    }

    /// A sender for a new listener.
    pub fn pulse(&self) -> Pulse {
        Pulse {
            tx: self.tx.clone(),
        }
    }

    /// Ties a listener task's lifetime to this receiver.
    pub fn attach(&mut self, listener: JoinHandle<()>) {
        self.listeners.push(listener);
    }

    /// Consumes every pending pulse. Returns whether there were any.
    pub fn drain(&mut self) -> bool {
        let mut any = false;
        while self.rx.try_recv().is_ok() {
            any = true;
        }
        any
    }

    /// Waits for the next pulse.
    ///
    /// Never returns while the queue is empty, so callers bound it with a
    /// timeout.
    pub async fn wait(&mut self) {
        // The receiver keeps a sender, so `recv` only yields `None` after
        // `close`, which nothing calls. Park instead of spinning.
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for WakeReceiver {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

fn spawn_listener<F>(name: &'static str, future: F) -> Result<JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Runtime(format!("{name} listener needs a tokio runtime: {e}")))?;
    Ok(handle.spawn(future))
}

// =============================================================================
// Notifier Trait
// =============================================================================

/// A source of "re-query" pulses.
///
/// # Rust Pattern: Trait Objects
///
/// Stores hold an `Arc<dyn ChangeNotifier>`, so every implementation must be
/// `Send + Sync` and object safe.
pub trait ChangeNotifier: Send + Sync {
    /// Signals that events up to `last_id` were committed.
    fn publish(&self, last_id: EventId);

    /// Spawns the listener task(s) that feed `wake`.
    ///
    /// Must be called from inside a tokio runtime.
    fn listen(&self, wake: &mut WakeReceiver) -> Result<()>;

    /// Creates a new subscriber queue fed by this notifier.
    fn subscribe(&self) -> Result<WakeReceiver> {
        let mut wake = WakeReceiver::new();
        self.listen(&mut wake)?;
        Ok(wake)
    }
}

// =============================================================================
// Local (push) Notifier
// =============================================================================

/// In-process push notifier.
///
/// Cloning shares the underlying channel, so every clone publishes to and
/// wakes the same subscribers.
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    tx: broadcast::Sender<EventId>,
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNotifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }
}

impl ChangeNotifier for LocalNotifier {
    fn publish(&self, last_id: EventId) {
        // No receivers is not an error: nobody is tailing yet.
        let _ = self.tx.send(last_id);
        trace!(last_id = %last_id, "published change pulse");
    }

    fn listen(&self, wake: &mut WakeReceiver) -> Result<()> {
        let mut source = self.tx.subscribe();
        let pulse = wake.pulse();
        let listener = spawn_listener("local", async move {
            loop {
                match source.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !pulse.send() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("local notifier listener exited");
        })?;
        wake.attach(listener);
        Ok(())
    }
}

// =============================================================================
// Polling Notifier
// =============================================================================

/// Timer-driven notifier: pulses every subscriber on a fixed interval.
///
/// Covers writers this process cannot observe. `publish` is a no-op.
#[derive(Debug, Clone)]
pub struct PollingNotifier {
    interval: Duration,
}

impl PollingNotifier {
    /// Creates a notifier that pulses every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The pulse interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl ChangeNotifier for PollingNotifier {
    fn publish(&self, _last_id: EventId) {}

    fn listen(&self, wake: &mut WakeReceiver) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Config("polling interval must be non-zero".to_string()));
        }
        let period = self.interval;
        let pulse = wake.pulse();
        let listener = spawn_listener("polling", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !pulse.send() {
                    break;
                }
            }
        })?;
        wake.attach(listener);
        Ok(())
    }
}

// =============================================================================
// Composite Notifier
// =============================================================================

/// Fans publish and subscribe out to several notifiers.
///
/// The usual pairing is a [`LocalNotifier`] for this process's writers plus a
/// [`PollingNotifier`] for everyone else's. All parts feed one queue, so
/// pulses still coalesce.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    parts: Vec<Arc<dyn ChangeNotifier>>,
}

impl std::fmt::Debug for CompositeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeNotifier")
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl CompositeNotifier {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a notifier (builder pattern).
    pub fn with(mut self, part: Arc<dyn ChangeNotifier>) -> Self {
        self.parts.push(part);
        self
    }
}

impl ChangeNotifier for CompositeNotifier {
    fn publish(&self, last_id: EventId) {
        for part in &self.parts {
            part.publish(last_id);
        }
    }

    fn listen(&self, wake: &mut WakeReceiver) -> Result<()> {
        for part in &self.parts {
            part.listen(wake)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
