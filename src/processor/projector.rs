//! Projectors: read models updated in the same transaction as the checkpoint.
//!
//! ```text
//! BEGIN IMMEDIATE
//!   handler.project(event, &tx)        -- writes to owned tables
//!   UPDATE checkpoints SET last_processed_event_id = event.id
//! COMMIT                               -- both or neither
//! ```
//!
//! A crash or error between the two statements can therefore never leave a
//! view that is ahead of, or behind, its checkpoint.

use rusqlite::Transaction;

use super::runtime::{ProcessingStrategy, ProcessorContext};
use super::ProcessorSpec;
use crate::error::Result;
use crate::types::Event;

/// Applies one event to a read model.
///
/// Closures `FnMut(&Event, &Transaction) -> Result<()>` implement this
/// directly.
pub trait Projection: Send {
    /// Mutates the read model. Must use `tx` for every write.
    fn project(&mut self, event: &Event, tx: &Transaction<'_>) -> Result<()>;
}

impl<F> Projection for F
where
    F: FnMut(&Event, &Transaction<'_>) -> Result<()> + Send,
{
    fn project(&mut self, event: &Event, tx: &Transaction<'_>) -> Result<()> {
        self(event, tx)
    }
}

/// Transactional projection strategy.
#[derive(Debug)]
pub struct Projector<H> {
    spec: ProcessorSpec,
    handler: H,
}

impl<H: Projection> Projector<H> {
    /// Creates a projector from its declaration and handler.
    pub fn new(spec: ProcessorSpec, handler: H) -> Self {
        Self { spec, handler }
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: Projection> ProcessingStrategy for Projector<H> {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    fn handle(&mut self, ctx: &ProcessorContext, event: &Event) -> Result<()> {
        let handler = &mut self.handler;
        ctx.tracker
            .with_processing(&ctx.name, event.id, |tx| handler.project(event, tx))
    }
}
