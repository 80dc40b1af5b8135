//! # Subscriptions: Catch-Up and Live Tailing
//!
//! A [`Subscription`] turns store queries plus notifier pulses into an ordered
//! stream of event batches handed to a [`Sink`].
//!
//! ## State Machine
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!              │                                          │
//!              ▼          page empty                      │
//!   start ──► Poll ──────────────────► Idle ──────────────┘
//!             │  ▲                      wait: pulse | wait_timeout | shutdown
//!   page with │  │ cursor = last.id
//!    events   ▼  │
//!            Deliver
//! ```
//!
//! - **Poll**: drain pending pulses, then `read_from(cursor + 1, types,
//!   batch_size)` until a page comes back empty
//! - **Deliver**: hand the page to the sink, ascending. Only after the sink
//!   returns `Ok` does the cursor move to the page's last id
//! - **Idle**: wait for a pulse, bounded by `wait_timeout`
//!
//! Pulses are drained *before* querying. A pulse arriving during the query
//! stays queued and causes one extra, possibly empty, poll. Draining after
//! the query could swallow the pulse for a commit the query missed.
//!
//! ## Shutdown
//!
//! Shutdown is a `tokio::sync::watch` flag checked at the top of each Poll
//! iteration and after each delivered page, never in the middle of one. The
//! Idle wait also listens for it, and is time-bounded anyway, so a quiet store
//! never pins a subscriber.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::notifier::WakeReceiver;
use crate::store::EventStore;
use crate::types::{Event, EventId, EventTypes};

// =============================================================================
// Sink
// =============================================================================

/// Receives delivered batches.
///
/// # Rust Pattern: Blanket Impl for Closures
///
/// Any `FnMut(&[Event]) -> Result<()>` is a sink, so ad-hoc consumers and
/// tests need no wrapper type.
pub trait Sink {
    /// Handles one batch. An error ends the run; the cursor stays before the
    /// batch.
    fn deliver(&mut self, batch: &[Event]) -> Result<()>;

    /// Called each time the subscription goes idle.
    fn on_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> Sink for F
where
    F: FnMut(&[Event]) -> Result<()>,
{
    fn deliver(&mut self, batch: &[Event]) -> Result<()> {
        self(batch)
    }
}

// =============================================================================
// State
// =============================================================================

/// Where the subscription loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for a pulse or the wait timeout.
    Idle,
    /// Querying the store.
    Poll,
    /// Handing a batch to the sink.
    Deliver,
}

/// Returns true once shutdown was requested or its sender is gone.
pub(crate) fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

// =============================================================================
// Subscription
// =============================================================================

/// An ordered, exactly-once feed of events after a cursor.
pub struct Subscription {
    store: Arc<EventStore>,
    types: EventTypes,
    batch_size: usize,
    wait_timeout: Duration,
    cursor: EventId,
    wake: WakeReceiver,
    shutdown: watch::Receiver<bool>,
    state: SubscriptionState,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cursor", &self.cursor)
            .field("types", &self.types)
            .field("state", &self.state)
            .finish()
    }
}

impl Subscription {
    /// Subscribes to the store's notifier and positions after `cursor`.
    ///
    /// The notifier subscription is taken here, before the first poll, so no
    /// commit between construction and the first query goes unannounced.
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<EventStore>,
        cursor: EventId,
        types: EventTypes,
        config: &ProcessorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let wake = store.notifier().subscribe()?;
        Ok(Self {
            store,
            types,
            batch_size: config.batch_size,
            wait_timeout: config.wait_timeout,
            cursor,
            wake,
            shutdown,
            state: SubscriptionState::Idle,
        })
    }

    /// The id of the last delivered event.
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Current loop state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Delivers everything after the cursor, then returns without waiting.
    ///
    /// Returns the number of events delivered.
    pub fn catch_up<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<u64> {
        let (delivered, _) = self.poll(sink)?;
        self.state = SubscriptionState::Idle;
        Ok(delivered)
    }

    /// Runs Poll → Deliver → Idle until shutdown is requested or the sink
    /// fails.
    pub async fn run<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        loop {
            if shutdown_requested(&self.shutdown) {
                debug!(cursor = %self.cursor, "subscription stopping");
                return Ok(());
            }

            let (_, stopped) = self.poll(sink)?;
            if stopped {
                debug!(cursor = %self.cursor, "subscription stopping after batch");
                return Ok(());
            }

            self.state = SubscriptionState::Idle;
            sink.on_idle()?;
            self.idle().await;
        }
    }

    /// One Poll pass. Returns events delivered and whether shutdown was
    /// observed after a batch.
    fn poll<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<(u64, bool)> {
        self.state = SubscriptionState::Poll;
        self.wake.drain();

        let mut delivered = 0u64;
        loop {
            let page = self
                .store
                .read_from(self.cursor.next(), &self.types, self.batch_size)?;
            let Some(last) = page.last().map(|e| e.id) else {
                return Ok((delivered, false));
            };

            self.state = SubscriptionState::Deliver;
            trace!(from = %page[0].id, to = %last, count = page.len(), "delivering batch");
            sink.deliver(&page)?;
            self.cursor = last;
            delivered += page.len() as u64;

            if shutdown_requested(&self.shutdown) {
                return Ok((delivered, true));
            }
            self.state = SubscriptionState::Poll;
        }
    }

    async fn idle(&mut self) {
        let wake = &mut self.wake;
        let shutdown = &mut self.shutdown;
        tokio::select! {
            _ = wake.wait() => {}
            _ = tokio::time::sleep(self.wait_timeout) => {}
            _ = shutdown.changed() => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
