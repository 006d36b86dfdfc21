use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::agents::AgentRole;
use crate::priority::Priority;

/// Payload key carrying the serialized task in TASK_ASSIGNMENT messages
pub const TASK_PAYLOAD_KEY: &str = "task";

/// Metadata key listing capabilities a worker must have to take the task
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Failure reported by a task executor
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub description: String,
    pub assigned_to: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub required_role: Option<AgentRole>,
}

impl AgentTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            assigned_to: None,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 300,
            metadata: Map::new(),
            required_role: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Capabilities listed under `required_capabilities` in the metadata.
    /// Non-string entries are ignored.
    pub fn required_capabilities(&self) -> Vec<&str> {
        self.metadata
            .get(REQUIRED_CAPABILITIES_KEY)
            .and_then(Value::as_array)
            .map(|caps| caps.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn to_payload(&self) -> Result<Map<String, Value>, TaskError> {
        let task = serde_json::to_value(self).map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        let mut payload = Map::new();
        payload.insert(TASK_PAYLOAD_KEY.to_string(), task);
        Ok(payload)
    }

    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, TaskError> {
        let task = payload
            .get(TASK_PAYLOAD_KEY)
            .cloned()
            .ok_or_else(|| TaskError::InvalidPayload(format!("missing '{TASK_PAYLOAD_KEY}' field")))?;
        serde_json::from_value(task).map_err(|e| TaskError::InvalidPayload(e.to_string()))
    }
}
