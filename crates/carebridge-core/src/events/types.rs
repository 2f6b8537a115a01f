use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use super::topic::Topic;

/// How a subscriber wants events delivered.
///
/// `Sync` subscribers run inline on the emitter's task before any `Async`
/// subscriber is scheduled; `Async` subscribers run on a dedicated worker
/// task that preserves per-subscriber ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Sync,
    Async,
}

/// An event flowing through the dispatcher. Events are delivered, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: Topic,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Emitting system, e.g. the host application name.
    pub source: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(topic: Topic, payload: Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            payload,
            timestamp: OffsetDateTime::now_utc(),
            source: source.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Operation context handed to the pluggable event-payload creator.
///
/// Gateways build every payload through the installed creator rather than
/// assembling JSON ad hoc, so observers see one stable shape.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub operation: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource: Option<Value>,
    pub source: Option<String>,
}

impl EventContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_resource(mut self, resource: Value) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The default payload shape recorded when no custom creator is
    /// installed.
    pub fn default_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("operation".into(), json!(self.operation));
        if let Some(resource_type) = &self.resource_type {
            payload.insert("resourceType".into(), json!(resource_type));
        }
        if let Some(resource_id) = &self.resource_id {
            payload.insert("resourceId".into(), json!(resource_id));
        }
        if let Some(resource) = &self.resource {
            payload.insert("resource".into(), resource.clone());
        }
        if let Some(source) = &self.source {
            payload.insert("source".into(), json!(source));
        }
        Value::Object(payload)
    }
}

/// Error a subscriber may report; logged by the dispatcher, never
/// propagated to the emitter.
#[derive(Debug, thiserror::Error)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
