use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::priority::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    TaskProgress,
    Request,
    Response,
    Broadcast,
    Heartbeat,
    Error,
    Shutdown,
}

/// Envelope passed between agents through the broker.
/// `to == None` means broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub in_response_to: Option<String>,
}

impl Message {
    pub fn new(message_type: MessageType, from: impl Into<String>, to: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            from: from.into(),
            to,
            payload: Map::new(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
            requires_response: false,
            in_response_to: None,
        }
    }

    pub fn direct(message_type: MessageType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(message_type, from, Some(to.into()))
    }

    pub fn broadcast(message_type: MessageType, from: impl Into<String>) -> Self {
        Self::new(message_type, from, None)
    }

    /// Build a message addressed back to this message's sender
    pub fn reply(&self, message_type: MessageType, from: impl Into<String>) -> Self {
        let mut reply = Self::new(message_type, from, Some(self.from.clone()));
        reply.in_response_to = Some(self.id.clone());
        reply.priority = self.priority;
        reply
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
