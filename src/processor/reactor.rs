//! Reactors: turn source events into new events, exactly once.
//!
//! ## Idempotency Cursor
//!
//! Besides the primary checkpoint, every reactor has `last_actioned_event_id`:
//! the last source event whose emissions are known to be in the log. It is
//! advanced in the same transaction as the emitted events and is never touched
//! by [`reset`](super::EventStreamProcessor::reset).
//!
//! ```text
//! source X ──► handler.react(X, emitter)            (no database access)
//!              BEGIN                                 (per write serialization)
//!                last_actioned >= X ?  ── yes ──► discard emissions
//!                      │ no
//!                append_in(...) per aggregate
//!                last_actioned = X
//!                last_processed = X
//!              COMMIT
//!              notifier.publish(...)                 (only if events were written)
//! ```
//!
//! ## Provenance and Self-Heal
//!
//! Emitted bodies are stamped with `_driven_by_event_id` and
//! `_driven_by_processor`. If the actioned cursor is `NULL` at startup, e.g.
//! for a checkpoint table recreated by hand, the reactor scans the log for the
//! highest id it stamped and adopts that.

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::runtime::{ProcessingStrategy, ProcessorContext};
use super::ProcessorSpec;
use crate::error::{Error, Result};
use crate::reader;
use crate::store::append_in;
use crate::types::{AggregateId, Event, EventId, EventTypes, NewEvent};

/// Body key holding the id of the source event.
pub const DRIVEN_BY_EVENT_ID: &str = "_driven_by_event_id";

/// Body key holding the emitting reactor's name.
pub const DRIVEN_BY_PROCESSOR: &str = "_driven_by_processor";

// =============================================================================
// Emitter
// =============================================================================

/// Collects the events a reactor wants to emit for one source event.
///
/// Emissions are validated and stamped on the way in and written only after
/// the handler returns.
#[derive(Debug)]
pub struct Emitter<'a> {
    spec: &'a ProcessorSpec,
    source: &'a Event,
    pending: Vec<NewEvent>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(spec: &'a ProcessorSpec, source: &'a Event) -> Self {
        Self {
            spec,
            source,
            pending: Vec::new(),
        }
    }

    /// The event being reacted to.
    pub fn source(&self) -> &Event {
        self.source
    }

    /// Queues an event for `aggregate_id`.
    ///
    /// # Errors
    ///
    /// - `Error::UndeclaredEventEmission` if `event_type` is not in the declared
    ///   `emits`
    /// - `Error::InvalidInput` if `body` is not a JSON object
    pub fn emit(
        &mut self,
        aggregate_id: impl Into<AggregateId>,
        event_type: impl Into<String>,
        body: Value,
    ) -> Result<()> {
        let event_type = event_type.into();
        if !self.spec.may_emit(&event_type) {
            return Err(Error::UndeclaredEventEmission {
                processor: self.spec.name.clone(),
                event_type,
            });
        }
        let Value::Object(mut fields) = body else {
            return Err(Error::InvalidInput(format!(
                "emitted '{event_type}' body must be a JSON object"
            )));
        };
        self.stamp(&mut fields);

        let source = self.source;
        let event = NewEvent::new(aggregate_id, event_type, Value::Object(fields))
            .with_causation_id(source.uuid)
            .with_correlation_id(source.correlation_id.unwrap_or(source.uuid));
        self.pending.push(event);
        Ok(())
    }

    fn stamp(&self, fields: &mut Map<String, Value>) {
        fields.insert(
            DRIVEN_BY_EVENT_ID.to_string(),
            Value::from(self.source.id.as_raw()),
        );
        fields.insert(
            DRIVEN_BY_PROCESSOR.to_string(),
            Value::from(self.spec.name.clone()),
        );
    }

    /// Number of queued emissions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Emissions grouped per aggregate, in order of first appearance.
    fn into_batches(self) -> Vec<Vec<NewEvent>> {
        let mut batches: Vec<Vec<NewEvent>> = Vec::new();
        for event in self.pending {
            match batches
                .iter_mut()
                .find(|b| b[0].aggregate_id == event.aggregate_id)
            {
                Some(batch) => batch.push(event),
                None => batches.push(vec![event]),
            }
        }
        batches
    }
}

// =============================================================================
// Reaction
// =============================================================================

/// Decides what to emit for one source event.
///
/// The handler gets no database access; everything it wants written goes
/// through the [`Emitter`]. Closures `FnMut(&Event, &mut Emitter) -> Result<()>`
/// implement this directly.
pub trait Reaction: Send {
    /// Emits zero or more events in response to `event`.
    fn react(&mut self, event: &Event, emit: &mut Emitter<'_>) -> Result<()>;
}

impl<F> Reaction for F
where
    F: FnMut(&Event, &mut Emitter<'_>) -> Result<()> + Send,
{
    fn react(&mut self, event: &Event, emit: &mut Emitter<'_>) -> Result<()> {
        self(event, emit)
    }
}

/// Idempotent emission strategy.
#[derive(Debug)]
pub struct Reactor<H> {
    spec: ProcessorSpec,
    handler: H,
}

impl<H: Reaction> Reactor<H> {
    /// Creates a reactor from its declaration and handler.
    pub fn new(spec: ProcessorSpec, handler: H) -> Self {
        Self { spec, handler }
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: Reaction> ProcessingStrategy for Reactor<H> {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    fn prepare(&mut self, ctx: &ProcessorContext) -> Result<()> {
        if ctx.tracker.last_actioned(&ctx.name)?.is_some() {
            return Ok(());
        }
        let emitted = EventTypes::only(self.spec.emits.iter().cloned());
        let healed = ctx.store.with_connection(|conn| {
            reader::max_driven_by(conn, ctx.store.tables(), &ctx.name, &emitted)
        })?;
        ctx.tracker.record_actioned(&ctx.name, healed)?;
        info!(processor = %ctx.name, last_actioned = %healed, "actioned cursor initialized from log");
        Ok(())
    }

    fn handle(&mut self, ctx: &ProcessorContext, event: &Event) -> Result<()> {
        let mut emitter = Emitter::new(&self.spec, event);
        self.handler.react(event, &mut emitter)?;
        let batches = emitter.into_batches();

        let tables = ctx.store.tables();
        let published: Option<EventId> = ctx.store.write_transaction(|tx| {
            let actioned = ctx
                .tracker
                .last_actioned_in(tx, &ctx.name)?
                .unwrap_or(EventId::ZERO);

            let mut last_written = None;
            if actioned >= event.id {
                if !batches.is_empty() {
                    debug!(
                        processor = %ctx.name,
                        event_id = %event.id,
                        last_actioned = %actioned,
                        "emissions already actioned; discarding"
                    );
                }
            } else if !batches.is_empty() {
                for batch in &batches {
                    let result = append_in(tx, tables, batch, None)?;
                    last_written = Some(result.last_id());
                }
                ctx.tracker.record_actioned_in(tx, &ctx.name, event.id)?;
            }

            ctx.tracker.record_processed_in(tx, &ctx.name, event.id)?;
            Ok(last_written)
        })?;

        if let Some(last_id) = published {
            debug!(processor = %ctx.name, event_id = %event.id, last_id = %last_id, "emitted events");
            ctx.store.notifier().publish(last_id);
        }
        Ok(())
    }
}
