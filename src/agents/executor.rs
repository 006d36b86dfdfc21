// Task execution contract. Concrete task bodies live outside this crate;
// workers only see the trait.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::role::AgentRole;
use crate::messaging::Message;
use crate::tasks::{AgentTask, TaskError};

#[cfg(test)]
use mockall::automock;

/// Role-specific task body run by a worker
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task and return its result
    async fn execute_task(&self, task: &AgentTask) -> Result<Value, TaskError>;

    /// Answer a REQUEST message. `None` means no payload to send back.
    async fn handle_request(&self, _request: &Message) -> Option<Value> {
        None
    }
}

/// Builds the executor for a newly spawned worker
pub trait ExecutorFactory: Send + Sync {
    fn executor_for(&self, role: AgentRole) -> Arc<dyn TaskExecutor>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(AgentRole) -> Arc<dyn TaskExecutor> + Send + Sync,
{
    fn executor_for(&self, role: AgentRole) -> Arc<dyn TaskExecutor> {
        self(role)
    }
}

/// Executor that logs the task and echoes it back, optionally after a delay.
/// Used by the demo binary and tests.
#[derive(Debug, Clone)]
pub struct EchoExecutor {
    role: AgentRole,
    delay: Duration,
}

impl EchoExecutor {
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Factory handing every role an `EchoExecutor` with the same delay
    pub fn factory(delay: Duration) -> Arc<dyn ExecutorFactory> {
        Arc::new(move |role: AgentRole| -> Arc<dyn TaskExecutor> {
            Arc::new(EchoExecutor::new(role).with_delay(delay))
        })
    }
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute_task(&self, task: &AgentTask) -> Result<Value, TaskError> {
        info!(role = %self.role, task_id = %task.id, description = %task.description, "Executing task");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(json!({
            "role": self.role,
            "task_id": task.id,
            "summary": format!("{} handled: {}", self.role, task.description),
        }))
    }

    async fn handle_request(&self, request: &Message) -> Option<Value> {
        Some(json!({ "role": self.role, "echo": request.payload }))
    }
}
