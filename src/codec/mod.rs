//! Event Codec
//!
//! Encodes events into a self-describing JSON document keyed by event type
//! and schema version, and decodes stored documents back into typed events,
//! running them through the upcaster chain first.
//!
//! Wire format:
//!
//! ```json
//! { "event_type": "MoneyDeposited", "schema_version": 1, "data": { ... } }
//! ```

pub mod upcaster;

pub use upcaster::{Upcaster, UpcasterChain};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved field naming the event type
pub const TYPE_FIELD: &str = "event_type";
/// Reserved field carrying the integer schema version
pub const VERSION_FIELD: &str = "schema_version";
/// Reserved field nesting all domain fields
pub const DATA_FIELD: &str = "data";

/// A domain event that can be persisted by the engine.
///
/// Events are immutable facts. The trait surfaces the discriminators the
/// store keeps alongside the payload and the markers the runtime consults
/// during dispatch and outbox staging.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Event type discriminator (stored alongside the payload)
    fn event_type(&self) -> &'static str;

    /// Schema version of this event's payload, starting at 1
    fn schema_version(&self) -> i32 {
        1
    }

    /// The aggregate this event belongs to
    fn aggregate_id(&self) -> Uuid;

    /// Whether the event is staged to the outbox at commit
    fn publishable(&self) -> bool {
        true
    }

    /// Tolerant events are skipped instead of failing when no handler matches
    fn tolerant(&self) -> bool {
        false
    }
}

/// JSON codec for event payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventCodec;

impl JsonEventCodec {
    /// Encode an event into the self-describing wire document
    pub fn encode<E: DomainEvent>(event: &E) -> Result<Value, CodecError> {
        if event.schema_version() < 1 {
            return Err(CodecError::InvalidField(VERSION_FIELD));
        }

        let data = serde_json::to_value(event)?;
        if !data.is_object() {
            return Err(CodecError::InvalidField(DATA_FIELD));
        }

        Ok(serde_json::json!({
            TYPE_FIELD: event.event_type(),
            VERSION_FIELD: event.schema_version(),
            DATA_FIELD: data,
        }))
    }

    /// Decode a stored document into a typed event, upcasting first.
    ///
    /// Any structural or deserialization failure means the payload cannot be
    /// understood at the aggregate's current schema and is reported as
    /// [`CodecError::Corrupted`].
    pub fn decode<E: DomainEvent>(doc: &Value, upcasters: &UpcasterChain) -> Result<E, CodecError> {
        let (event_type, schema_version, data) = Self::parts(doc)?;
        let event_type = event_type.to_string();

        let (schema_version, data) = upcasters.upcast(&event_type, schema_version, data)?;

        serde_json::from_value(data).map_err(|source| CodecError::Corrupted {
            event_type,
            schema_version,
            reason: source.to_string(),
        })
    }

    /// Structural check: split a stored document into its reserved parts
    pub fn parts(doc: &Value) -> Result<(&str, i32, Value), CodecError> {
        let object = doc.as_object().ok_or(CodecError::InvalidField(DATA_FIELD))?;

        let event_type = object
            .get(TYPE_FIELD)
            .ok_or(CodecError::MissingField(TYPE_FIELD))?
            .as_str()
            .ok_or(CodecError::InvalidField(TYPE_FIELD))?;

        let schema_version = object
            .get(VERSION_FIELD)
            .ok_or(CodecError::MissingField(VERSION_FIELD))?
            .as_i64()
            .filter(|v| *v >= 1 && *v <= i32::MAX as i64)
            .ok_or(CodecError::InvalidField(VERSION_FIELD))?;

        let data = object
            .get(DATA_FIELD)
            .ok_or(CodecError::MissingField(DATA_FIELD))?;
        if !data.is_object() {
            return Err(CodecError::InvalidField(DATA_FIELD));
        }

        Ok((event_type, schema_version as i32, data.clone()))
    }

    /// Rebuild a wire document from its parts (used after upcasting)
    pub fn assemble(event_type: &str, schema_version: i32, data: Value) -> Value {
        serde_json::json!({
            TYPE_FIELD: event_type,
            VERSION_FIELD: schema_version,
            DATA_FIELD: data,
        })
    }
}

/// Errors raised while encoding, upcasting or decoding payloads
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload is missing one of the reserved fields
    #[error("Payload is missing reserved field '{0}'")]
    MissingField(&'static str),

    /// A reserved field has the wrong shape
    #[error("Payload field '{0}' is malformed")]
    InvalidField(&'static str),

    /// Payload cannot be brought to a shape the aggregate understands
    #[error("Corrupted payload for event '{event_type}' v{schema_version}: {reason}")]
    Corrupted {
        event_type: String,
        schema_version: i32,
        reason: String,
    },

    /// An upcaster was registered with a non-advancing target version
    #[error("Upcaster for '{event_type}' must advance the version: {source_version} -> {target_version}")]
    InvalidUpcaster {
        event_type: String,
        source_version: i32,
        target_version: i32,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
