//! # Typed Event Bodies
//!
//! The store keeps bodies as JSON text; this module maps them to and from
//! Rust types.
//!
//! ## Mapping
//!
//! ```text
//! struct OrderPlaced { total: u64 }            EVENT_TYPE = "order_placed"
//!        │  serde_json::to_value                     │
//!        ▼                                           ▼
//! NewEvent { event_type: "order_placed", body: {"total": 10}, .. }
//!        │  append ... read
//!        ▼
//! Event::decode::<OrderPlaced>()  ── type mismatch or bad JSON ──► Error::Codec
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::processor::Emitter;
use crate::types::{AggregateId, Event, NewEvent};

/// A Rust type stored as the body of one event type.
///
/// # Example
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use spiteflow::{EventBody, NewEvent};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced {
///     total: u64,
/// }
///
/// impl EventBody for OrderPlaced {
///     const EVENT_TYPE: &'static str = "order_placed";
/// }
///
/// let event = NewEvent::from_body("order-1", &OrderPlaced { total: 10 })?;
/// assert_eq!(event.event_type, "order_placed");
/// # Ok::<(), spiteflow::Error>(())
/// ```
pub trait EventBody: Serialize + DeserializeOwned {
    /// The `type` column value for this body.
    const EVENT_TYPE: &'static str;
}

impl NewEvent {
    /// Builds an event from a typed body.
    pub fn from_body<T: EventBody>(aggregate_id: impl Into<AggregateId>, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| Error::Codec(format!("cannot encode {}: {e}", T::EVENT_TYPE)))?;
        Ok(NewEvent::new(aggregate_id, T::EVENT_TYPE, value))
    }
}

impl Event {
    /// Whether this event carries a `T` body.
    pub fn is<T: EventBody>(&self) -> bool {
        self.event_type == T::EVENT_TYPE
    }

    /// Decodes the body as `T`.
    ///
    /// Unknown fields, including the reactor provenance stamps, are ignored
    /// unless `T` opts into `deny_unknown_fields`.
    pub fn decode<T: EventBody>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(Error::Codec(format!(
                "event {} has type '{}', expected '{}'",
                self.id,
                self.event_type,
                T::EVENT_TYPE
            )));
        }
        T::deserialize(&self.body)
            .map_err(|e| Error::Codec(format!("cannot decode event {} as {}: {e}", self.id, T::EVENT_TYPE)))
    }
}

impl Emitter<'_> {
    /// Emits a typed body.
    pub fn emit_body<T: EventBody>(&mut self, aggregate_id: impl Into<AggregateId>, body: &T) -> Result<()> {
        let value = serde_json::to_value(body)
            .map_err(|e| Error::Codec(format!("cannot encode {}: {e}", T::EVENT_TYPE)))?;
        self.emit(aggregate_id, T::EVENT_TYPE, value)
    }
}
