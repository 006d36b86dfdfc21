//! Priority queues and workload-aware task assignment.
//!
//! Queues are strict across priority tiers and FIFO within a tier. The
//! distributor owns the task registry; everything else sees clones.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{AgentTask, TaskStatus};
use crate::agents::AgentRole;
use crate::priority::Priority;
use crate::retry::{BackoffPolicy, Jitter};

#[derive(Debug, Error, PartialEq)]
pub enum DistributorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already submitted: {0}")]
    DuplicateTask(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    /// Extra random delay as a fraction of the computed backoff
    pub retry_jitter_ratio: f64,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 60_000,
            retry_jitter_ratio: 0.1,
            default_max_retries: 3,
            default_timeout_secs: 300,
        }
    }
}

impl DistributorConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
            Duration::from_millis(self.retry_max_delay_ms),
            Jitter::Proportional(self.retry_jitter_ratio),
        )
    }
}

/// A worker that may receive a task in this assignment round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCandidate {
    pub id: String,
    pub role: AgentRole,
    pub capabilities: Vec<String>,
}

impl WorkerCandidate {
    pub fn can_take(&self, task: &AgentTask) -> bool {
        if let Some(role) = task.required_role {
            if role != self.role {
                return false;
            }
        }
        task.required_capabilities()
            .iter()
            .all(|cap| self.capabilities.iter().any(|have| have == cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in its priority queue after the backoff
    Requeued { retry_count: u32 },
    /// Retries used up; the task is now failed
    Exhausted,
    /// The task reached a terminal state while backing off
    Finished,
}

#[derive(Debug, Default)]
struct DistributorState {
    tasks: HashMap<String, AgentTask>,
    queues: HashMap<Priority, VecDeque<String>>,
    workload: HashMap<String, u32>,
}

impl DistributorState {
    fn release(&mut self, worker_id: &str) {
        if let Some(load) = self.workload.get_mut(worker_id) {
            *load = load.saturating_sub(1);
            if *load == 0 {
                self.workload.remove(worker_id);
            }
        }
    }

    fn load_of(&self, worker_id: &str) -> u32 {
        self.workload.get(worker_id).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct TaskDistributor {
    config: DistributorConfig,
    backoff: BackoffPolicy,
    state: Mutex<DistributorState>,
}

impl Default for TaskDistributor {
    fn default() -> Self {
        Self::new(DistributorConfig::default())
    }
}

impl TaskDistributor {
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            backoff: config.backoff(),
            config,
            state: Mutex::new(DistributorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DistributorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending task at the tail of its priority queue
    pub fn submit_task(
        &self,
        id: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
        required_role: Option<AgentRole>,
        metadata: Map<String, Value>,
    ) -> Result<AgentTask, DistributorError> {
        let mut task = AgentTask::new(id, description, priority);
        task.required_role = required_role;
        task.metadata = metadata;
        task.max_retries = self.config.default_max_retries;
        task.timeout_secs = self.config.default_timeout_secs;
        self.submit(task)
    }

    /// Register a fully built task. Its status is reset to pending.
    pub fn submit(&self, mut task: AgentTask) -> Result<AgentTask, DistributorError> {
        let mut state = self.lock();
        if state.tasks.contains_key(&task.id) {
            return Err(DistributorError::DuplicateTask(task.id));
        }

        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        state
            .queues
            .entry(task.priority)
            .or_default()
            .push_back(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());

        debug!(
            task_id = %task.id,
            priority = %task.priority,
            required_role = ?task.required_role,
            "Task queued"
        );
        Ok(task)
    }

    /// Pair queued tasks with available workers, highest priority first.
    /// Each worker receives at most one task per call; among eligible
    /// workers the one with the lowest workload wins. A task no worker can
    /// take stays at the head of its queue and ends that tier's round.
    pub fn assign_tasks(&self, available: &[WorkerCandidate]) -> Vec<(String, AgentTask)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut available: Vec<&WorkerCandidate> = available.iter().collect();
        let mut assignments = Vec::new();

        for priority in Priority::DESCENDING {
            while !available.is_empty() {
                let Some(queue) = state.queues.get_mut(&priority) else {
                    break;
                };
                let Some(task_id) = queue.pop_front() else {
                    break;
                };

                let Some(task) = state.tasks.get_mut(&task_id) else {
                    warn!(task_id = %task_id, "Dropping queue entry for unknown task");
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }

                let workload = &state.workload;
                let pick = available
                    .iter()
                    .enumerate()
                    .filter(|(_, worker)| worker.can_take(task))
                    .min_by_key(|(_, worker)| workload.get(&worker.id).copied().unwrap_or(0))
                    .map(|(index, _)| index);

                let Some(index) = pick else {
                    queue.push_front(task_id);
                    break;
                };

                let worker = available.remove(index);
                task.status = TaskStatus::Assigned;
                task.assigned_to = Some(worker.id.clone());
                *state.workload.entry(worker.id.clone()).or_insert(0) += 1;

                debug!(task_id = %task.id, worker_id = %worker.id, priority = %priority, "Task assigned");
                assignments.push((worker.id.clone(), task.clone()));
            }
        }

        assignments
    }

    /// Record a task outcome. Calls on an already terminal task change nothing.
    pub fn complete_task(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<AgentTask, DistributorError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DistributorError::TaskNotFound(task_id.to_string()))?;

        if task.is_terminal() {
            debug!(task_id = %task_id, status = task.status.as_str(), "Ignoring result for finished task");
            return Ok(task.clone());
        }

        task.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        task.result = result;
        task.error = error;
        task.completed_at = Some(Utc::now());
        let task = task.clone();

        if let Some(worker_id) = &task.assigned_to {
            state.release(worker_id);
        }

        info!(
            task_id = %task.id,
            status = task.status.as_str(),
            assigned_to = ?task.assigned_to,
            "Task finished"
        );
        Ok(task)
    }

    /// Put a task back in its queue after a backoff delay. The previous
    /// assignee's workload is released at once. Once `max_retries` is
    /// reached the task is failed with `reason`.
    pub async fn retry_task(&self, task_id: &str, reason: &str) -> Result<RetryOutcome, DistributorError> {
        let delay = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| DistributorError::TaskNotFound(task_id.to_string()))?;

            if task.is_terminal() {
                return Ok(RetryOutcome::Finished);
            }

            let previous = task.assigned_to.take();
            task.status = TaskStatus::Pending;
            task.started_at = None;

            let outcome = if task.retry_count >= task.max_retries {
                task.status = TaskStatus::Failed;
                task.error = Some(reason.to_string());
                task.completed_at = Some(Utc::now());
                warn!(
                    task_id = %task_id,
                    retry_count = task.retry_count,
                    reason = %reason,
                    "Task retries exhausted"
                );
                Err(RetryOutcome::Exhausted)
            } else {
                Ok(self.backoff.delay_for(task.retry_count))
            };

            if let Some(worker_id) = previous {
                state.release(&worker_id);
            }

            match outcome {
                Ok(delay) => delay,
                Err(exhausted) => return Ok(exhausted),
            }
        };

        debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, reason = %reason, "Backing off before requeue");
        tokio::time::sleep(delay).await;

        let mut guard = self.lock();
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DistributorError::TaskNotFound(task_id.to_string()))?;

        if task.is_terminal() {
            return Ok(RetryOutcome::Finished);
        }

        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        let retry_count = task.retry_count;
        let priority = task.priority;
        state
            .queues
            .entry(priority)
            .or_default()
            .push_back(task_id.to_string());

        info!(task_id = %task_id, retry_count, priority = %priority, "Task requeued");
        Ok(RetryOutcome::Requeued { retry_count })
    }

    /// Record that the assignee began executing. Only valid while assigned.
    pub fn mark_started(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        match state.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.started_at.get_or_insert_with(Utc::now);
                true
            }
            _ => false,
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<AgentTask> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn queue_sizes(&self) -> BTreeMap<Priority, usize> {
        let state = self.lock();
        Priority::DESCENDING
            .iter()
            .map(|priority| (*priority, state.queues.get(priority).map_or(0, VecDeque::len)))
            .collect()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let state = self.lock();
        let mut counts = BTreeMap::new();
        for task in state.tasks.values() {
            *counts.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Ids of tasks currently assigned to `worker_id`
    pub fn tasks_assigned_to(&self, worker_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Assigned)
            .filter(|task| task.assigned_to.as_deref() == Some(worker_id))
            .map(|task| task.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn workload(&self, worker_id: &str) -> u32 {
        self.lock().load_of(worker_id)
    }

    /// Roles required by queued tasks, in the order they would be served
    pub fn pending_roles(&self) -> Vec<AgentRole> {
        let state = self.lock();
        let mut roles = Vec::new();
        for priority in Priority::DESCENDING {
            let Some(queue) = state.queues.get(&priority) else {
                continue;
            };
            for task_id in queue {
                let role = state.tasks.get(task_id).and_then(|task| task.required_role);
                if let Some(role) = role {
                    if !roles.contains(&role) {
                        roles.push(role);
                    }
                }
            }
        }
        roles
    }
}
