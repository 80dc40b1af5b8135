//! # Process Supervisor
//!
//! Runs each processor on its own OS thread with its own current-thread tokio
//! runtime, restarts it after failures according to a [`RetryPolicy`], and
//! shuts everything down cooperatively on SIGINT/SIGTERM.
//!
//! ```text
//!                      ┌──────────── Supervisor (caller's runtime) ────────────┐
//!                      │  trigger: signal | run_until future | ShutdownHandle  │
//!                      │                     │ watch<bool>                     │
//!                      └─────────────────────┼─────────────────────────────────┘
//!                ┌───────────────────────────┼────────────────────────────┐
//!                ▼                           ▼                            ▼
//!     thread "spiteflow-views"   thread "spiteflow-mailer"    thread "spiteflow-..."
//!     current-thread runtime     current-thread runtime       current-thread runtime
//!     loop { run → fail → log → backoff } until shutdown, success or fatal error
//! ```
//!
//! ## Backoff Scope
//!
//! An exponential delay doubles only while the *same* event keeps failing.
//! Once a different event fails (the previous one eventually succeeded), the
//! delay starts over at `base`.
//!
//! ## Fatal Errors
//!
//! [`Error::is_fatal`] errors end the unit whatever the policy says. Retrying a
//! lost processor lock or an undeclared emission cannot succeed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, FutureExt, LocalBoxFuture};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::config::{RetryPolicy, SupervisorConfig};
use crate::error::{Error, Result};
use crate::processor::{EventStreamProcessor, ProcessingStrategy};
use crate::subscription::shutdown_requested;
use crate::types::EventId;

// =============================================================================
// Supervised Units
// =============================================================================

/// Something the supervisor can run and restart.
///
/// `run` returns `Ok(())` only after observing shutdown; any error is a fault.
/// The future is polled on the unit's own current-thread runtime, so it need
/// not be `Send`.
pub trait Supervised: Send {
    /// Name used in logs and thread names.
    fn name(&self) -> &str;

    /// Runs until shutdown or failure.
    fn run(&mut self, shutdown: watch::Receiver<bool>) -> LocalBoxFuture<'_, Result<()>>;
}

impl<S: ProcessingStrategy> Supervised for EventStreamProcessor<S> {
    fn name(&self) -> &str {
        EventStreamProcessor::name(self)
    }

    fn run(&mut self, shutdown: watch::Receiver<bool>) -> LocalBoxFuture<'_, Result<()>> {
        EventStreamProcessor::run(self, shutdown).boxed_local()
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Tracks the retry delay for one unit.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Option<Duration>,
    last_event: Option<EventId>,
}

impl Backoff {
    /// Creates a tracker with no failures recorded.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: None,
            last_event: None,
        }
    }

    /// Records a failure on `event` and returns how long to wait before
    /// retrying, or `None` to give up.
    pub fn next_delay(&mut self, event: Option<EventId>) -> Option<Duration> {
        let delay = match self.policy {
            RetryPolicy::None => return None,
            RetryPolicy::Constant { delay } => delay,
            RetryPolicy::Exponential { base, max } => {
                let same_event = self.current.is_some() && self.last_event == event;
                match self.current {
                    Some(previous) if same_event => previous.saturating_mul(2).min(max),
                    _ => base.min(max),
                }
            }
        };
        self.current = Some(delay);
        self.last_event = event;
        Some(delay)
    }
}

// =============================================================================
// Shutdown
// =============================================================================

/// Requests cooperative shutdown of every supervised unit.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Asks every unit to stop at its next safe point.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register unix signal handlers; falling back to ctrl-c");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c"),
        Err(e) => {
            error!(error = %e, "failed to listen for ctrl-c; shutdown only via handle");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Exit Reports
// =============================================================================

/// How a supervised unit ended.
#[derive(Debug)]
pub enum UnitOutcome {
    /// Stopped after a shutdown request.
    Stopped,
    /// Gave up: fatal error, retry policy `None`, or thread failure.
    Failed(Error),
}

/// Exit report for one unit.
#[derive(Debug)]
pub struct UnitExit {
    /// The unit name.
    pub name: String,
    /// How it ended.
    pub outcome: UnitOutcome,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns a set of units and runs them until shutdown.
pub struct Supervisor {
    config: SupervisorConfig,
    units: Vec<Box<dyn Supervised>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("units", &self.units.iter().map(|u| u.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Supervisor {
    /// Creates a supervisor with no units.
    pub fn new(config: SupervisorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            units: Vec::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Adds a unit (builder pattern).
    pub fn with_unit(mut self, unit: impl Supervised + 'static) -> Self {
        self.units.push(Box::new(unit));
        self
    }

    /// Adds a unit.
    pub fn add(&mut self, unit: Box<dyn Supervised>) {
        self.units.push(unit);
    }

    /// A handle that stops every unit.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Runs every unit until SIGINT/SIGTERM or until all units exit.
    pub async fn run(self) -> Result<Vec<UnitExit>> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs every unit until `trigger` resolves, a [`ShutdownHandle`] is used,
    /// or all units exit on their own. Then waits for every unit to stop.
    pub async fn run_until<F>(self, trigger: F) -> Result<Vec<UnitExit>>
    where
        F: Future<Output = ()>,
    {
        let Supervisor {
            config,
            units,
            shutdown,
        } = self;

        let mut exits = Vec::with_capacity(units.len());
        for unit in units {
            match spawn_unit(unit, config.retry, shutdown.subscribe()) {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    shutdown.send_replace(true);
                    join_all(exits).await;
                    return Err(e);
                }
            }
        }
        info!(units = exits.len(), "supervisor started");

        let all_exited = join_all(exits);
        tokio::pin!(all_exited);
        tokio::pin!(trigger);

        let reports = tokio::select! {
            reports = &mut all_exited => reports,
            _ = &mut trigger => {
                info!("shutdown requested; stopping units");
                shutdown.send_replace(true);
                all_exited.await
            }
        };
        info!("supervisor stopped");
        Ok(reports)
    }
}

/// Spawns the unit's thread. The returned future resolves with its exit.
fn spawn_unit(
    mut unit: Box<dyn Supervised>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<impl Future<Output = UnitExit>> {
    let name = unit.name().to_string();
    let (tx, rx) = oneshot::channel();

    let thread_name = name.clone();
    std::thread::Builder::new()
        .name(format!("spiteflow-{thread_name}"))
        .spawn(move || {
            let outcome = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(supervise(unit.as_mut(), policy, shutdown)),
                Err(e) => UnitOutcome::Failed(Error::Runtime(format!(
                    "failed to create runtime for {thread_name}: {e}"
                ))),
            };
            let _ = tx.send(outcome);
        })
        .map_err(|e| Error::Runtime(format!("failed to spawn thread for {name}: {e}")))?;

    Ok(async move {
        let outcome = rx.await.unwrap_or_else(|_| {
            UnitOutcome::Failed(Error::Runtime(format!("processor thread {name} panicked")))
        });
        UnitExit { name, outcome }
    })
}

/// The restart loop for one unit.
async fn supervise(
    unit: &mut dyn Supervised,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> UnitOutcome {
    let name = unit.name().to_string();
    let mut backoff = Backoff::new(policy);

    loop {
        let err = match unit.run(shutdown.clone()).await {
            Ok(()) => {
                info!(processor = %name, "processor stopped");
                return UnitOutcome::Stopped;
            }
            Err(e) => e,
        };

        error!(processor = %name, error = %err.chain(), "processor failed");

        if err.is_fatal() {
            error!(processor = %name, "fatal error; not retrying");
            return UnitOutcome::Failed(err);
        }
        let Some(delay) = backoff.next_delay(err.offending_event()) else {
            return UnitOutcome::Failed(err);
        };

        warn!(
            processor = %name,
            delay_ms = delay.as_millis() as u64,
            event_id = ?err.offending_event().map(|id| id.as_raw()),
            "restarting after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        if shutdown_requested(&shutdown) {
            info!(processor = %name, "shutdown during backoff");
            return UnitOutcome::Stopped;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
