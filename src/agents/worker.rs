//! A single worker agent: a mailbox loop around a role-specific executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statig::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::executor::TaskExecutor;
use super::lifecycle::{AgentStatus, LifecycleEvent, WorkerLifecycle};
use super::metrics::AgentMetrics;
use super::role::AgentRole;
use crate::memory::SharedMemory;
use crate::messaging::{Message, MessageBroker, MessageType};
use crate::tasks::{AgentTask, TaskError};

/// Ids of recently handled messages kept for duplicate detection
const SEEN_MESSAGE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// How long `stop()` waits for the loop before aborting it
    pub stop_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            heartbeat_interval_secs: 30,
            stop_grace_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Status view of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub last_error: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SeenMessages {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    /// Returns false if `id` was already recorded
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_MESSAGE_LIMIT {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

pub struct AgentWorker {
    agent_id: String,
    role: AgentRole,
    capabilities: Vec<String>,
    config: WorkerConfig,
    coordinator_id: Option<String>,
    broker: Arc<MessageBroker>,
    memory: Arc<SharedMemory>,
    executor: Arc<dyn TaskExecutor>,
    lifecycle: Mutex<StateMachine<WorkerLifecycle>>,
    metrics: Mutex<AgentMetrics>,
    seen: Mutex<SeenMessages>,
    executing: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentWorker")
            .field("agent_id", &self.agent_id)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentWorker {
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        executor: Arc<dyn TaskExecutor>,
        broker: Arc<MessageBroker>,
        memory: Arc<SharedMemory>,
        config: WorkerConfig,
    ) -> Self {
        let agent_id = agent_id.into();
        let (stop_tx, _) = watch::channel(false);
        Self {
            lifecycle: Mutex::new(WorkerLifecycle::new(agent_id.clone()).state_machine()),
            agent_id,
            role,
            capabilities: role.default_capabilities(),
            config,
            coordinator_id: None,
            broker,
            memory,
            executor,
            metrics: Mutex::new(AgentMetrics::default()),
            seen: Mutex::new(SeenMessages::default()),
            executing: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Heartbeats go to this agent's mailbox
    pub fn with_coordinator(mut self, coordinator_id: impl Into<String>) -> Self {
        self.coordinator_id = Some(coordinator_id.into());
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn status(&self) -> AgentStatus {
        lock(&self.lifecycle).inner().status()
    }

    pub fn metrics(&self) -> AgentMetrics {
        lock(&self.metrics).clone()
    }

    /// Time since the worker last polled its mailbox or made task progress
    pub fn idle_for(&self) -> Duration {
        lock(&self.metrics).idle_for()
    }

    pub fn metrics_key(&self) -> String {
        format!("agent:{}:metrics", self.agent_id)
    }

    pub fn summary(&self) -> WorkerSummary {
        let (status, current_task, last_error) = {
            let lifecycle = lock(&self.lifecycle);
            let inner = lifecycle.inner();
            (
                inner.status(),
                inner.current_task().map(str::to_string),
                inner.last_error().map(str::to_string),
            )
        };
        let metrics = self.metrics();
        WorkerSummary {
            agent_id: self.agent_id.clone(),
            role: self.role,
            status,
            current_task,
            last_error,
            tasks_completed: metrics.tasks_completed,
            tasks_failed: metrics.tasks_failed,
            success_rate: metrics.success_rate,
            last_active: metrics.last_active,
        }
    }

    fn transition(&self, event: LifecycleEvent) -> AgentStatus {
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.handle(&event);
        lifecycle.inner().status()
    }

    /// Force the worker into ERROR. It keeps draining its mailbox but
    /// answers assignments with an error until it is restarted.
    pub fn mark_error(&self, reason: &str) {
        self.transition(LifecycleEvent::Fault {
            reason: reason.to_string(),
        });
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Move to IDLE and launch the message loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return;
        }

        self.broker.register(&self.agent_id);
        self.transition(LifecycleEvent::Start);
        lock(&self.metrics).touch();

        let worker = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        *handle = Some(tokio::spawn(async move { worker.run(stop_rx).await }));

        info!(agent_id = %self.agent_id, role = %self.role, "Worker started");
    }

    /// True while an `execute_task` call is in flight
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Signal the loop to stop, wait up to the grace period, then abort it.
    /// A loop still inside `execute_task` after the grace period is detached
    /// instead: the task runs to completion (bounded by its own timeout) and
    /// the loop exits afterwards.
    pub async fn stop(&self) {
        if self.status() == AgentStatus::Stopped {
            return;
        }

        self.stop_tx.send_replace(true);
        self.transition(LifecycleEvent::Stop);

        let handle = lock(&self.handle).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.config.stop_grace(), &mut handle).await.is_err() {
                if self.is_executing() {
                    warn!(agent_id = %self.agent_id, "Worker still executing after grace period, leaving task to finish");
                } else {
                    warn!(agent_id = %self.agent_id, "Worker did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }

        self.finish_stop();
    }

    fn finish_stop(&self) {
        self.transition(LifecycleEvent::Stop);
        if self.transition(LifecycleEvent::Halted) == AgentStatus::Stopped {
            let leftover = self.broker.unregister(&self.agent_id);
            info!(agent_id = %self.agent_id, dropped_messages = leftover.len(), "Worker stopped");
        }
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
                received = self.broker.receive(&self.agent_id, self.config.poll_timeout()) => {
                    lock(&self.metrics).touch();
                    if let Some(message) = received {
                        if !self.handle_message(message).await {
                            break;
                        }
                    }
                }
            }
        }

        debug!(agent_id = %self.agent_id, "Worker loop exited");
        if !*stop_rx.borrow() {
            // stopped by a SHUTDOWN message rather than stop()
            self.finish_stop();
        }
    }

    /// Returns false when the loop should exit
    async fn handle_message(&self, message: Message) -> bool {
        lock(&self.metrics).messages_received += 1;
        self.broker.acknowledge(&message.id);

        if !lock(&self.seen).insert(&message.id) {
            debug!(agent_id = %self.agent_id, message_id = %message.id, "Ignoring duplicate delivery");
            return true;
        }

        match message.message_type {
            MessageType::TaskAssignment => self.handle_assignment(&message).await,
            MessageType::Request => self.handle_request(&message).await,
            MessageType::Shutdown => {
                info!(agent_id = %self.agent_id, from = %message.from, "Shutdown requested");
                return false;
            }
            other => {
                debug!(agent_id = %self.agent_id, message_type = ?other, from = %message.from, "Ignoring message");
            }
        }
        true
    }

    async fn send(&self, message: Message) {
        lock(&self.metrics).messages_sent += 1;
        self.broker.send(message).await;
    }

    async fn handle_assignment(&self, message: &Message) {
        let task = match AgentTask::from_payload(&message.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(agent_id = %self.agent_id, message_id = %message.id, error = %e, "Rejecting assignment");
                lock(&self.metrics).errors_encountered += 1;
                let reply = message
                    .reply(MessageType::Error, self.agent_id.clone())
                    .with_field("error", e.to_string());
                self.send(reply).await;
                return;
            }
        };

        if self.status() == AgentStatus::Error {
            warn!(agent_id = %self.agent_id, task_id = %task.id, "Worker in ERROR, refusing task");
            let error = TaskError::Failed(format!("worker {} is in ERROR state", self.agent_id));
            self.send(self.result_message(message, &task, Err(error), Duration::ZERO)).await;
            return;
        }

        self.transition(LifecycleEvent::BeginTask {
            task_id: task.id.clone(),
        });
        let progress = message
            .reply(MessageType::TaskProgress, self.agent_id.clone())
            .with_field("task_id", task.id.clone())
            .with_field("stage", "started");
        self.send(progress).await;

        info!(agent_id = %self.agent_id, task_id = %task.id, "Executing task");
        let started = Instant::now();
        let outcome = self.execute_keeping_alive(&task).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => info!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                duration_ms = elapsed.as_millis() as u64,
                "Task completed"
            ),
            Err(e) => warn!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "Task failed"
            ),
        }

        lock(&self.metrics).record_task(outcome.is_ok(), elapsed);
        self.transition(LifecycleEvent::FinishTask);
        self.publish_metrics().await;
        self.send(self.result_message(message, &task, outcome, elapsed)).await;
    }

    /// Run the task under its timeout. The mailbox loop is parked meanwhile,
    /// so activity and heartbeats are kept up here for the liveness check.
    async fn execute_keeping_alive(&self, task: &AgentTask) -> Result<Value, TaskError> {
        self.executing.store(true, Ordering::SeqCst);
        let execution = tokio::time::timeout(task.timeout(), self.executor.execute_task(task));
        tokio::pin!(execution);

        let mut activity = tokio::time::interval(self.config.poll_timeout());
        activity.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                finished = &mut execution => {
                    break match finished {
                        Ok(outcome) => outcome,
                        Err(_) => Err(TaskError::Timeout(task.timeout())),
                    };
                }
                _ = activity.tick() => lock(&self.metrics).touch(),
                _ = heartbeat.tick() => self.send_heartbeat().await,
            }
        };
        self.executing.store(false, Ordering::SeqCst);
        outcome
    }

    fn result_message(
        &self,
        assignment: &Message,
        task: &AgentTask,
        outcome: Result<Value, TaskError>,
        elapsed: Duration,
    ) -> Message {
        let reply = assignment
            .reply(MessageType::TaskResult, self.agent_id.clone())
            .with_field("task_id", task.id.clone())
            .with_field("success", outcome.is_ok())
            .with_field("duration_ms", elapsed.as_millis() as u64);
        match outcome {
            Ok(result) => reply.with_field("result", result),
            Err(e) => reply.with_field("error", e.to_string()),
        }
    }

    async fn handle_request(&self, message: &Message) {
        let answer = self.executor.handle_request(message).await;
        if message.requires_response {
            let reply = message
                .reply(MessageType::Response, self.agent_id.clone())
                .with_field("result", answer.unwrap_or(Value::Null));
            self.send(reply).await;
        }
    }

    async fn send_heartbeat(&self) {
        let Some(coordinator) = &self.coordinator_id else {
            return;
        };
        let heartbeat = Message::direct(MessageType::Heartbeat, self.agent_id.clone(), coordinator.clone())
            .with_field("status", self.status().as_str())
            .with_field("role", self.role.as_str());
        self.send(heartbeat).await;
    }

    async fn publish_metrics(&self) {
        let snapshot = match serde_json::to_value(self.metrics()) {
            Ok(value) => value,
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to serialize worker metrics");
                return;
            }
        };
        let mut record = json!({ "role": self.role, "status": self.status() });
        if let (Some(record), Value::Object(metrics)) = (record.as_object_mut(), snapshot) {
            record.extend(metrics);
        }
        self.memory.set(&self.metrics_key(), record, None).await;
    }
}

impl Drop for AgentWorker {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::executor::MockTaskExecutor;
    use crate::messaging::BrokerConfig;
    use crate::priority::Priority;
    use async_trait::async_trait;

    fn fast_broker() -> Arc<MessageBroker> {
        Arc::new(MessageBroker::new(BrokerConfig {
            poll_interval_ms: 1,
            ..BrokerConfig::default()
        }))
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_timeout_ms: 5,
            heartbeat_interval_secs: 3600,
            stop_grace_ms: 500,
        }
    }

    fn spawn_worker(executor: Arc<dyn TaskExecutor>, broker: &Arc<MessageBroker>) -> Arc<AgentWorker> {
        let worker = Arc::new(AgentWorker::new(
            "worker-1",
            AgentRole::Researcher,
            executor,
            Arc::clone(broker),
            Arc::new(SharedMemory::in_memory()),
            fast_config(),
        ));
        worker.start();
        worker
    }

    fn assignment(task: &AgentTask) -> Message {
        Message::direct(MessageType::TaskAssignment, "coordinator", "worker-1")
            .with_payload(task.to_payload().unwrap())
    }

    async fn next_of_type(broker: &MessageBroker, agent: &str, wanted: MessageType) -> Message {
        loop {
            let message = broker
                .receive(agent, Duration::from_secs(5))
                .await
                .expect("no message before timeout");
            if message.message_type == wanted {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_assignment_reports_progress_then_result() {
        let mut executor = MockTaskExecutor::new();
        executor
            .expect_execute_task()
            .times(1)
            .returning(|task| Ok(json!({ "echo": task.description.clone() })));

        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(executor), &broker);
        let task = AgentTask::new("t1", "find sources", Priority::High);
        broker.send(assignment(&task)).await;

        let progress = next_of_type(&broker, "coordinator", MessageType::TaskProgress).await;
        assert_eq!(progress.payload["stage"], "started");

        let result = next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        assert_eq!(result.payload["task_id"], "t1");
        assert_eq!(result.payload["success"], true);
        assert_eq!(result.payload["result"]["echo"], "find sources");

        let metrics = worker.metrics();
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(worker.status(), AgentStatus::Idle);

        let (stored, version) = worker.memory.get(&worker.metrics_key(), Value::Null).await;
        assert_eq!(stored["tasks_completed"], 1);
        assert_eq!(stored["role"], "researcher");
        assert_eq!(version, 1);

        worker.stop().await;
        assert_eq!(worker.status(), AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failed_result() {
        let mut executor = MockTaskExecutor::new();
        executor
            .expect_execute_task()
            .returning(|_| Err(TaskError::Failed("site unreachable".into())));

        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(executor), &broker);
        broker
            .send(assignment(&AgentTask::new("t1", "scrape", Priority::Normal)))
            .await;

        let result = next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        assert_eq!(result.payload["success"], false);
        assert_eq!(result.payload["error"], "Task failed: site unreachable");
        assert_eq!(worker.metrics().tasks_failed, 1);
        assert_eq!(worker.metrics().success_rate, 0.0);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_executes_once() {
        let mut executor = MockTaskExecutor::new();
        executor.expect_execute_task().times(1).returning(|_| Ok(json!(1)));

        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(executor), &broker);
        let message = assignment(&AgentTask::new("t1", "once", Priority::Normal));
        broker.send(message.clone()).await;
        broker.send(message).await;

        next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.mailbox_len("coordinator"), 0);
        assert_eq!(worker.metrics().messages_received, 2);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_error_state_refuses_assignments() {
        let mut executor = MockTaskExecutor::new();
        executor.expect_execute_task().times(0);

        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(executor), &broker);
        worker.mark_error("injected");
        broker
            .send(assignment(&AgentTask::new("t1", "never runs", Priority::Normal)))
            .await;

        let result = next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        assert_eq!(result.payload["success"], false);
        assert_eq!(worker.summary().last_error.as_deref(), Some("injected"));
        worker.stop().await;
        assert_eq!(worker.status(), AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_request_gets_response_when_required() {
        let mut executor = MockTaskExecutor::new();
        executor
            .expect_handle_request()
            .returning(|request| Some(json!({ "seen": request.payload["q"].clone() })));

        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(executor), &broker);
        let request = Message::direct(MessageType::Request, "client", "worker-1")
            .with_field("q", "status?")
            .expecting_response();
        broker.send(request.clone()).await;

        let response = next_of_type(&broker, "client", MessageType::Response).await;
        assert_eq!(response.in_response_to.as_deref(), Some(request.id.as_str()));
        assert_eq!(response.payload["result"]["seen"], "status?");
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_message_stops_loop() {
        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(MockTaskExecutor::new()), &broker);
        broker
            .send(Message::direct(MessageType::Shutdown, "coordinator", "worker-1"))
            .await;

        for _ in 0..200 {
            if worker.status() == AgentStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.status(), AgentStatus::Stopped);
        assert!(!broker.is_registered("worker-1"));
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute_task(&self, _task: &AgentTask) -> Result<Value, TaskError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_task_timeout_is_reported() {
        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(SlowExecutor), &broker);
        let mut task = AgentTask::new("slow", "takes forever", Priority::Normal);
        task.timeout_secs = 1;
        broker.send(assignment(&task)).await;

        let result = next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        assert_eq!(result.payload["success"], false);
        assert!(result.payload["error"].as_str().unwrap().contains("timed out"));
        worker.stop().await;
    }

    struct PausingExecutor(Duration);

    #[async_trait]
    impl TaskExecutor for PausingExecutor {
        async fn execute_task(&self, task: &AgentTask) -> Result<Value, TaskError> {
            tokio::time::sleep(self.0).await;
            Ok(json!(task.id.clone()))
        }
    }

    #[tokio::test]
    async fn test_stop_lets_running_task_finish() {
        let broker = fast_broker();
        let worker = Arc::new(AgentWorker::new(
            "worker-1",
            AgentRole::Extractor,
            Arc::new(PausingExecutor(Duration::from_millis(300))),
            Arc::clone(&broker),
            Arc::new(SharedMemory::in_memory()),
            WorkerConfig {
                stop_grace_ms: 20,
                ..fast_config()
            },
        ));
        worker.start();
        broker
            .send(assignment(&AgentTask::new("t1", "long extract", Priority::Normal)))
            .await;
        next_of_type(&broker, "coordinator", MessageType::TaskProgress).await;
        assert!(worker.is_executing());

        worker.stop().await;
        assert_eq!(worker.status(), AgentStatus::Stopped);

        let result = next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        assert_eq!(result.payload["success"], true);
        assert_eq!(result.payload["result"], "t1");
        assert!(!worker.is_executing());
    }

    #[tokio::test]
    async fn test_activity_refreshed_while_executing() {
        let broker = fast_broker();
        let worker = spawn_worker(Arc::new(PausingExecutor(Duration::from_millis(200))), &broker);
        broker
            .send(assignment(&AgentTask::new("t1", "slow but alive", Priority::Normal)))
            .await;
        next_of_type(&broker, "coordinator", MessageType::TaskProgress).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(worker.status(), AgentStatus::Busy);
        assert!(worker.idle_for() < Duration::from_millis(100));

        next_of_type(&broker, "coordinator", MessageType::TaskResult).await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_goes_to_coordinator() {
        let broker = fast_broker();
        let worker = Arc::new(
            AgentWorker::new(
                "worker-1",
                AgentRole::Writer,
                Arc::new(MockTaskExecutor::new()),
                Arc::clone(&broker),
                Arc::new(SharedMemory::in_memory()),
                fast_config(),
            )
            .with_coordinator("coordinator"),
        );
        worker.start();

        let heartbeat = next_of_type(&broker, "coordinator", MessageType::Heartbeat).await;
        assert_eq!(heartbeat.from, "worker-1");
        assert_eq!(heartbeat.payload["role"], "writer");
        worker.stop().await;
    }
}
