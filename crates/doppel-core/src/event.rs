//! Event envelope
//!
//! The envelope is the only message shape carried by the bus: a topic,
//! a JSON body with the domain payload, and a metadata map for
//! auxiliary context. Envelopes are immutable once published; the bus
//! hands subscribers shared references.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{Timestamp, Topic, TwinError, TwinResult};

/// Metadata key carrying the publishing adapter's id
pub const METADATA_ADAPTER_ID: &str = "adapter_id";

/// Metadata key carrying the snapshot preceding a state update
pub const METADATA_PREVIOUS_STATE: &str = "dt.state.update.metadata.previous_state";

/// Metadata key carrying the ordered change-list of a state update
pub const METADATA_CHANGE_LIST: &str = "dt.state.update.metadata.change_list";

/// Metadata key carrying the event key of a notification
pub const METADATA_EVENT_KEY: &str = "dt.state.event.metadata.key";

/// Metadata key carrying a lifecycle state label
pub const METADATA_LIFECYCLE_STATE: &str = "lifecycle_state";

/// Metadata key carrying an error description on unbound notifications
pub const METADATA_ERROR: &str = "error";

/// One published event: topic, payload, auxiliary context
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    topic: Topic,
    body: Value,
    metadata: HashMap<String, Value>,
    created_at: Timestamp,
}

impl EventEnvelope {
    pub fn new(topic: impl Into<Topic>) -> Self {
        EventEnvelope {
            topic: topic.into(),
            body: Value::Null,
            metadata: HashMap::new(),
            created_at: Timestamp::now(),
        }
    }

    /// Set the body from any serializable payload
    pub fn with_body<T: Serialize>(mut self, body: &T) -> TwinResult<Self> {
        self.body = serde_json::to_value(body)
            .map_err(|e| TwinError::Runtime(format!("envelope body serialization: {}", e)))?;
        Ok(self)
    }

    /// Set the body from an already-built JSON value
    pub fn with_body_value(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Attach one metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[inline]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    #[inline]
    pub fn body(&self) -> &Value {
        &self.body
    }

    #[inline]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Metadata entry as a string slice, when it is a JSON string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    #[inline]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_body_and_metadata() {
        let envelope = EventEnvelope::new("dt.state.update")
            .with_body_value(json!({"temperature": 21.5}))
            .with_metadata(METADATA_ADAPTER_ID, json!("mqtt-adapter"));

        assert_eq!(envelope.topic().as_str(), "dt.state.update");
        assert_eq!(envelope.body()["temperature"], json!(21.5));
        assert_eq!(envelope.metadata_str(METADATA_ADAPTER_ID), Some("mqtt-adapter"));
        assert!(envelope.metadata_value("missing").is_none());
    }

    #[test]
    fn test_envelope_serializable_body() {
        #[derive(Serialize)]
        struct Payload {
            key: String,
        }

        let envelope = EventEnvelope::new("dt.lifecycle")
            .with_body(&Payload { key: "dt_bound".into() })
            .unwrap();
        assert_eq!(envelope.body()["key"], json!("dt_bound"));
    }
}
