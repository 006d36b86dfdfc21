//! Composition root: elects a coordinator, owns the worker pool, and runs
//! the coordination and health loops while it leads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::executor::ExecutorFactory;
use super::lifecycle::AgentStatus;
use super::role::AgentRole;
use super::worker::{AgentWorker, WorkerConfig, WorkerSummary};
use crate::circuit_breaker::{CircuitBreaker, CircuitInfo, CircuitState};
use crate::config::HiveConfig;
use crate::election::{ElectionError, LeaderElection};
use crate::memory::{MemoryError, SharedMemory};
use crate::messaging::{BrokerStats, Message, MessageBroker, MessageType};
use crate::observability::{CoordinationMetrics, CoordinationStats, OperationTimer};
use crate::priority::Priority;
use crate::tasks::{AgentTask, DistributorError, RetryOutcome, TaskDistributor, TaskStatus, WorkerCandidate};
use crate::telemetry::{create_coordination_span, generate_correlation_id};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Leader election failed: {0}")]
    Election(#[from] ElectionError),

    #[error("Shared memory unavailable: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Distributor(#[from] DistributorError),

    #[error("Task {task_id} failed: {error}")]
    TaskFailed { task_id: String, error: String },

    #[error("Invalid orchestrator configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agent_id: String,
    pub roles: Vec<AgentRole>,
    pub agents_per_role: usize,
    pub min_agents: usize,
    pub max_agents: usize,
    pub coordination_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// A worker silent for longer than this fails its liveness check
    pub liveness_timeout_secs: u64,
    /// Scale up when more tasks than this are queued and no worker is idle
    pub scale_up_queue_threshold: usize,
    /// Scale down when more workers than this are idle
    pub scale_down_idle_threshold: usize,
    pub dispatch_ack_timeout_ms: u64,
    pub result_poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_id: "orchestrator".to_string(),
            roles: AgentRole::ALL.to_vec(),
            agents_per_role: 1,
            min_agents: 1,
            max_agents: 10,
            coordination_interval_ms: 1000,
            health_check_interval_ms: 5000,
            liveness_timeout_secs: 30,
            scale_up_queue_threshold: 5,
            scale_down_idle_threshold: 2,
            dispatch_ack_timeout_ms: 5000,
            result_poll_interval_ms: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.agent_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig("agent_id must not be empty".into()));
        }
        if self.max_agents == 0 || self.min_agents > self.max_agents {
            return Err(OrchestratorError::InvalidConfig(format!(
                "need 0 < min_agents ({}) <= max_agents ({})",
                self.min_agents, self.max_agents
            )));
        }
        if self.coordination_interval_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(OrchestratorError::InvalidConfig("loop intervals must be positive".into()));
        }
        Ok(())
    }

    fn roles(&self) -> Vec<AgentRole> {
        if self.roles.is_empty() {
            AgentRole::ALL.to_vec()
        } else {
            self.roles.clone()
        }
    }

    /// Roles of the pool spawned on election: `agents_per_role` of each
    /// configured role, topped up to `min_agents`, capped at `max_agents`
    pub fn initial_pool(&self) -> Vec<AgentRole> {
        let roles = self.roles();
        let mut plan: Vec<AgentRole> = roles
            .iter()
            .flat_map(|role| std::iter::repeat(*role).take(self.agents_per_role))
            .collect();
        let mut next = 0;
        while plan.len() < self.min_agents {
            plan.push(roles[next % roles.len()]);
            next += 1;
        }
        plan.truncate(self.max_agents);
        plan
    }
}

/// JSON-serializable snapshot returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub agent_id: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub running: bool,
    pub total_agents: usize,
    pub agents_by_status: BTreeMap<String, usize>,
    pub agents_by_role: BTreeMap<String, usize>,
    pub agents: Vec<WorkerSummary>,
    pub queue_sizes: BTreeMap<String, usize>,
    pub task_counts: BTreeMap<String, usize>,
    pub circuits: BTreeMap<String, CircuitInfo>,
    pub broker: BrokerStats,
    pub coordination: CoordinationStats,
}

pub fn circuit_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct AgentOrchestrator {
    config: OrchestratorConfig,
    worker_config: WorkerConfig,
    broker: Arc<MessageBroker>,
    memory: Arc<SharedMemory>,
    election: LeaderElection,
    distributor: TaskDistributor,
    circuits: CircuitBreaker,
    executors: Arc<dyn ExecutorFactory>,
    workers: Mutex<BTreeMap<String, Arc<AgentWorker>>>,
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
    metrics: CoordinationMetrics,
    running: AtomicBool,
    leading: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("agent_id", &self.config.agent_id)
            .field("is_leader", &self.election.is_leader())
            .field("workers", &lock(&self.workers).len())
            .finish_non_exhaustive()
    }
}

impl AgentOrchestrator {
    /// Build every component from `config`. Nothing runs until `start`.
    pub async fn from_config(
        config: &HiveConfig,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        config.orchestrator.validate()?;
        let election = LeaderElection::new(config.orchestrator.agent_id.clone(), config.election.clone())?;
        let memory = SharedMemory::open(&config.memory).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config: config.orchestrator.clone(),
            worker_config: config.worker.clone(),
            broker: Arc::new(MessageBroker::new(config.broker.clone())),
            memory: Arc::new(memory),
            election,
            distributor: TaskDistributor::new(config.distributor.clone()),
            circuits: CircuitBreaker::new(config.circuit_breaker.clone()),
            executors,
            workers: Mutex::new(BTreeMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            metrics: CoordinationMetrics::new(),
            running: AtomicBool::new(false),
            leading: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    pub fn distributor(&self) -> &TaskDistributor {
        &self.distributor
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuits
    }

    pub fn worker(&self, agent_id: &str) -> Option<Arc<AgentWorker>> {
        lock(&self.workers).get(agent_id).cloned()
    }

    pub fn workers(&self) -> Vec<Arc<AgentWorker>> {
        lock(&self.workers).values().cloned().collect()
    }

    /// Run the election. The leader spawns its pool and loops; a follower
    /// keeps re-running the election until the leader goes stale.
    pub async fn start(self: &Arc<Self>) -> Result<bool, OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(self.is_leader());
        }
        self.shutdown_tx.send_replace(false);
        self.broker.register(&self.config.agent_id);

        if self.election.run_election().await? {
            self.become_leader();
            return Ok(true);
        }

        info!(
            agent_id = %self.config.agent_id,
            leader = ?self.election.get_leader(),
            "Starting as follower"
        );
        self.spawn_follower_watch();
        Ok(false)
    }

    fn become_leader(self: &Arc<Self>) {
        if self.leading.swap(true, Ordering::SeqCst) {
            return;
        }

        let plan = self.config.initial_pool();
        info!(agent_id = %self.config.agent_id, workers = plan.len(), "Leading, spawning worker pool");
        for role in plan {
            self.spawn_worker(role);
        }

        self.spawn_loop("coordination", self.config.coordination_interval_ms, |this| async move {
            if this.is_leader() {
                this.coordinate().await;
            } else {
                debug!(agent_id = %this.config.agent_id, "Not leader, skipping coordination");
            }
            true
        });
        self.spawn_loop("health", self.config.health_check_interval_ms, |this| async move {
            if this.is_leader() {
                this.check_health().await;
            } else {
                match this.election.run_election().await {
                    Ok(true) => info!(agent_id = %this.config.agent_id, "Regained leadership"),
                    Ok(false) => debug!(agent_id = %this.config.agent_id, "Leadership still held elsewhere"),
                    Err(e) => warn!(agent_id = %this.config.agent_id, error = %e, "Election re-check failed"),
                }
            }
            true
        });
    }

    fn spawn_follower_watch(self: &Arc<Self>) {
        let interval_ms = self.election.config().stale_threshold_ms;
        self.spawn_loop("follower_watch", interval_ms, |this| async move {
            match this.election.run_election().await {
                Ok(true) => {
                    info!(agent_id = %this.config.agent_id, "Leader went stale, taking over");
                    this.become_leader();
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    warn!(agent_id = %this.config.agent_id, error = %e, "Election re-check failed");
                    true
                }
            }
        });
    }

    /// Run `tick` every `interval_ms` until shutdown, the orchestrator is
    /// dropped, or `tick` returns false
    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, interval_ms: u64, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        if !tick(this).await {
                            break;
                        }
                    }
                }
            }
            debug!(loop_name = name, "Loop exited");
        });
        lock(&self.loops).push(handle);
    }

    fn spawn_worker(&self, role: AgentRole) -> Arc<AgentWorker> {
        let simple = Uuid::new_v4().simple().to_string();
        let agent_id = format!("{}-{}", role, &simple[..8]);
        let worker = Arc::new(
            AgentWorker::new(
                agent_id.clone(),
                role,
                self.executors.executor_for(role),
                Arc::clone(&self.broker),
                Arc::clone(&self.memory),
                self.worker_config.clone(),
            )
            .with_coordinator(self.config.agent_id.clone()),
        );
        worker.start();
        lock(&self.workers).insert(agent_id.clone(), Arc::clone(&worker));
        CoordinationMetrics::incr(&self.metrics.workers_spawned);
        info!(agent_id = %agent_id, role = %role, "Worker spawned");
        worker
    }

    async fn coordinate(self: &Arc<Self>) {
        let timer = OperationTimer::new("coordination_tick");
        self.process_inbox();
        self.distribute_tasks();
        self.auto_scale().await;
        self.collect_metrics().await;
        CoordinationMetrics::incr(&self.metrics.coordination_ticks);
        timer.finish();
    }

    fn process_inbox(&self) {
        while let Some(message) = self.broker.try_receive(&self.config.agent_id) {
            match message.message_type {
                MessageType::TaskResult => self.handle_result(&message),
                MessageType::TaskProgress => {
                    if let Some(task_id) = message.payload_str("task_id") {
                        self.distributor.mark_started(task_id);
                    }
                }
                MessageType::Heartbeat => {
                    lock(&self.last_seen).insert(message.from.clone(), message.timestamp);
                }
                MessageType::Error => {
                    warn!(
                        from = %message.from,
                        error = ?message.payload.get("error"),
                        "Worker reported an error"
                    );
                }
                other => debug!(message_type = ?other, from = %message.from, "Unhandled coordinator message"),
            }
        }
    }

    fn handle_result(&self, message: &Message) {
        let Some(task_id) = message.payload_str("task_id") else {
            warn!(from = %message.from, "Task result without task_id");
            return;
        };
        CoordinationMetrics::incr(&self.metrics.results_received);

        let success = message.payload.get("success").and_then(Value::as_bool).unwrap_or(false);
        let outcome = if success {
            let result = message.payload.get("result").cloned().unwrap_or(Value::Null);
            self.distributor.complete_task(task_id, Some(result), None)
        } else {
            let error = message
                .payload_str("error")
                .unwrap_or("task failed without an error message")
                .to_string();
            self.distributor.complete_task(task_id, None, Some(error))
        };

        if let Err(e) = outcome {
            warn!(task_id = %task_id, from = %message.from, error = %e, "Result for unknown task");
        }
    }

    /// Idle workers with no outstanding task and an available circuit
    fn candidates(&self) -> Vec<WorkerCandidate> {
        self.workers()
            .into_iter()
            .filter(|worker| worker.status() == AgentStatus::Idle)
            .filter(|worker| self.distributor.workload(worker.agent_id()) == 0)
            .filter(|worker| self.circuits.is_available(&circuit_key(worker.agent_id())))
            .map(|worker| WorkerCandidate {
                id: worker.agent_id().to_string(),
                role: worker.role(),
                capabilities: worker.capabilities().to_vec(),
            })
            .collect()
    }

    fn distribute_tasks(self: &Arc<Self>) {
        if self.distributor.queued_count() == 0 {
            return;
        }
        let candidates = self.candidates();
        if candidates.is_empty() {
            return;
        }

        for (worker_id, task) in self.distributor.assign_tasks(&candidates) {
            let correlation_id = generate_correlation_id();
            let span = create_coordination_span(
                "dispatch_task",
                Some(&worker_id),
                Some(&task.id),
                Some(&correlation_id),
            );
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch(worker_id, task).await }.instrument(span));
        }
    }

    async fn dispatch(self: Arc<Self>, worker_id: String, task: AgentTask) {
        let key = circuit_key(&worker_id);
        if !self.circuits.can_execute(&key) {
            debug!(task_id = %task.id, worker_id = %worker_id, "Circuit refused dispatch");
            self.requeue(&task.id, "worker circuit open").await;
            return;
        }

        let payload = match task.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not encode task");
                self.requeue(&task.id, &e.to_string()).await;
                return;
            }
        };
        let assignment = Message::direct(MessageType::TaskAssignment, self.config.agent_id.clone(), worker_id.clone())
            .with_payload(payload)
            .with_priority(task.priority)
            .expecting_response();

        let ack_timeout = Duration::from_millis(self.config.dispatch_ack_timeout_ms);
        if self.broker.send_with_ack(assignment, ack_timeout).await {
            self.circuits.record_success(&key);
            CoordinationMetrics::incr(&self.metrics.tasks_dispatched);
            info!(task_id = %task.id, worker_id = %worker_id, priority = %task.priority, "Task dispatched");
        } else {
            self.circuits.record_failure(&key);
            CoordinationMetrics::incr(&self.metrics.dispatch_failures);
            warn!(task_id = %task.id, worker_id = %worker_id, "Dispatch not acknowledged");
            self.requeue(&task.id, "dispatch not acknowledged").await;
        }
    }

    async fn requeue(&self, task_id: &str, reason: &str) {
        match self.distributor.retry_task(task_id, reason).await {
            Ok(RetryOutcome::Requeued { retry_count }) => {
                CoordinationMetrics::incr(&self.metrics.tasks_requeued);
                debug!(task_id = %task_id, retry_count, "Task back in queue");
            }
            Ok(RetryOutcome::Exhausted) => {
                warn!(task_id = %task_id, reason = %reason, "Task failed after exhausting retries");
            }
            Ok(RetryOutcome::Finished) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "Requeue failed"),
        }
    }

    fn is_alive(&self, worker: &AgentWorker, now: DateTime<Utc>) -> bool {
        if worker.status().is_down() {
            return false;
        }
        let mut silent_for = worker.idle_for();
        if let Some(seen) = lock(&self.last_seen).get(worker.agent_id()) {
            silent_for = silent_for.min((now - *seen).to_std().unwrap_or(Duration::ZERO));
        }
        silent_for < Duration::from_secs(self.config.liveness_timeout_secs)
    }

    async fn check_health(self: &Arc<Self>) {
        let now = Utc::now();
        for worker in self.workers() {
            if self.is_alive(&worker, now) {
                continue;
            }

            let key = circuit_key(worker.agent_id());
            self.circuits.record_failure(&key);
            warn!(
                agent_id = %worker.agent_id(),
                status = %worker.status(),
                circuit = ?self.circuits.state(&key),
                "Worker failed liveness check"
            );

            if self.circuits.state(&key) == CircuitState::Open {
                self.restart_worker(&worker).await;
            }
        }
    }

    /// Replace `worker` with a fresh instance of the same role. Tasks still
    /// assigned to it go back through the retry path.
    async fn restart_worker(self: &Arc<Self>, worker: &Arc<AgentWorker>) {
        let old_id = worker.agent_id().to_string();
        worker.stop().await;
        lock(&self.workers).remove(&old_id);
        lock(&self.last_seen).remove(&old_id);

        for task_id in self.distributor.tasks_assigned_to(&old_id) {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.requeue(&task_id, "assigned worker restarted").await });
        }

        self.circuits.reset(&circuit_key(&old_id));
        let replacement = self.spawn_worker(worker.role());
        CoordinationMetrics::incr(&self.metrics.workers_restarted);
        info!(
            old_agent_id = %old_id,
            new_agent_id = %replacement.agent_id(),
            role = %worker.role(),
            "Worker restarted"
        );
    }

    async fn auto_scale(self: &Arc<Self>) {
        let workers = self.workers();
        let total = workers.len();
        let idle: Vec<&Arc<AgentWorker>> = workers
            .iter()
            .filter(|worker| worker.status() == AgentStatus::Idle)
            .filter(|worker| self.distributor.workload(worker.agent_id()) == 0)
            .collect();

        let mut per_role: BTreeMap<AgentRole, usize> = BTreeMap::new();
        for worker in &workers {
            *per_role.entry(worker.role()).or_insert(0) += 1;
        }

        if total < self.config.max_agents {
            let pending_roles = self.distributor.pending_roles();

            // queued work for a role nobody can serve
            if let Some(role) = pending_roles.iter().find(|role| !per_role.contains_key(role)) {
                self.scale_up(*role, "no worker for required role");
                return;
            }

            let queued = self.distributor.queued_count();
            if queued > self.config.scale_up_queue_threshold && idle.is_empty() {
                let role = pending_roles.first().copied().unwrap_or_else(|| {
                    let roles = self.config.roles();
                    roles
                        .iter()
                        .copied()
                        .min_by_key(|role| per_role.get(role).copied().unwrap_or(0))
                        .unwrap_or(AgentRole::Researcher)
                });
                self.scale_up(role, "queue above watermark");
                return;
            }
        }

        if idle.len() > self.config.scale_down_idle_threshold && total > self.config.min_agents {
            let victim = idle
                .iter()
                .rev()
                .find(|worker| per_role.get(&worker.role()).copied().unwrap_or(0) > 1);
            if let Some(victim) = victim {
                let agent_id = victim.agent_id().to_string();
                lock(&self.workers).remove(&agent_id);
                lock(&self.last_seen).remove(&agent_id);
                victim.stop().await;
                self.circuits.reset(&circuit_key(&agent_id));
                CoordinationMetrics::incr(&self.metrics.scale_downs);
                CoordinationMetrics::incr(&self.metrics.workers_retired);
                info!(agent_id = %agent_id, role = %victim.role(), idle = idle.len(), "Scaled down");
            }
        }
    }

    fn scale_up(&self, role: AgentRole, reason: &str) {
        let worker = self.spawn_worker(role);
        CoordinationMetrics::incr(&self.metrics.scale_ups);
        info!(agent_id = %worker.agent_id(), role = %role, reason = %reason, "Scaled up");
    }

    async fn collect_metrics(&self) {
        let workers = self.workers();
        let completed: u64 = workers.iter().map(|w| w.metrics().tasks_completed).sum();
        let failed: u64 = workers.iter().map(|w| w.metrics().tasks_failed).sum();
        let record = json!({
            "total_agents": workers.len(),
            "queued": self.distributor.queued_count(),
            "tasks_completed": completed,
            "tasks_failed": failed,
            "coordination": self.metrics.get_stats(),
            "updated_at": Utc::now(),
        });
        let key = format!("orchestrator:{}:metrics", self.config.agent_id);
        self.memory.set(&key, record, None).await;
    }

    /// Queue a task; returns its generated id
    pub fn submit_task(
        &self,
        description: impl Into<String>,
        priority: Priority,
        required_role: Option<AgentRole>,
        metadata: Map<String, Value>,
    ) -> Result<String, OrchestratorError> {
        let task_id = Uuid::new_v4().to_string();
        let task = self
            .distributor
            .submit_task(task_id.clone(), description, priority, required_role, metadata)?;
        CoordinationMetrics::incr(&self.metrics.tasks_submitted);
        info!(task_id = %task.id, priority = %task.priority, required_role = ?task.required_role, "Task submitted");
        Ok(task_id)
    }

    /// Wait for a task to finish. `Ok(None)` means it was still running at
    /// the deadline; a timeout too large to represent waits indefinitely.
    pub async fn get_task_result(&self, task_id: &str, timeout: Duration) -> Result<Option<Value>, OrchestratorError> {
        let deadline = Instant::now().checked_add(timeout);
        let poll = Duration::from_millis(self.config.result_poll_interval_ms.max(1));
        loop {
            let task = self
                .distributor
                .get_task(task_id)
                .ok_or_else(|| DistributorError::TaskNotFound(task_id.to_string()))?;
            match task.status {
                TaskStatus::Completed => return Ok(Some(task.result.unwrap_or(Value::Null))),
                TaskStatus::Failed => {
                    return Err(OrchestratorError::TaskFailed {
                        task_id: task.id,
                        error: task.error.unwrap_or_default(),
                    })
                }
                TaskStatus::Pending | TaskStatus::Assigned => {}
            }

            let mut pause = poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let agents: Vec<WorkerSummary> = self.workers().iter().map(|worker| worker.summary()).collect();
        let mut agents_by_status = BTreeMap::new();
        let mut agents_by_role = BTreeMap::new();
        for agent in &agents {
            *agents_by_status.entry(agent.status.to_string()).or_insert(0) += 1;
            *agents_by_role.entry(agent.role.to_string()).or_insert(0) += 1;
        }

        OrchestratorStatus {
            agent_id: self.config.agent_id.clone(),
            is_leader: self.is_leader(),
            leader: self.election.get_leader(),
            running: self.running.load(Ordering::SeqCst),
            total_agents: agents.len(),
            agents_by_status,
            agents_by_role,
            agents,
            queue_sizes: self
                .distributor
                .queue_sizes()
                .into_iter()
                .map(|(priority, size)| (priority.to_string(), size))
                .collect(),
            task_counts: self.distributor.status_counts(),
            circuits: self.circuits.all_circuits(),
            broker: self.broker.stats(),
            coordination: self.metrics.get_stats(),
        }
    }

    /// Halt the loops, stop every worker and resign leadership
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(agent_id = %self.config.agent_id, "Stopping orchestrator");
        self.shutdown_tx.send_replace(true);

        let loops: Vec<JoinHandle<()>> = lock(&self.loops).drain(..).collect();
        for mut handle in loops {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let workers: Vec<Arc<AgentWorker>> = {
            let mut map = lock(&self.workers);
            std::mem::take(&mut *map).into_values().collect()
        };
        for worker in workers {
            worker.stop().await;
        }

        self.election.resign().await;
        self.leading.store(false, Ordering::SeqCst);
        self.metrics.log_stats();
    }
}

impl Drop for AgentOrchestrator {
    fn drop(&mut self) {
        for handle in lock(&self.loops).drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_pool_covers_roles() {
        let config = OrchestratorConfig {
            roles: vec![AgentRole::Researcher, AgentRole::Writer],
            agents_per_role: 2,
            ..OrchestratorConfig::default()
        };
        assert_eq!(
            config.initial_pool(),
            vec![
                AgentRole::Researcher,
                AgentRole::Researcher,
                AgentRole::Writer,
                AgentRole::Writer
            ]
        );
    }

    #[test]
    fn test_initial_pool_respects_bounds() {
        let topped_up = OrchestratorConfig {
            roles: vec![AgentRole::Validator],
            agents_per_role: 1,
            min_agents: 3,
            ..OrchestratorConfig::default()
        };
        assert_eq!(topped_up.initial_pool(), vec![AgentRole::Validator; 3]);

        let capped = OrchestratorConfig {
            agents_per_role: 5,
            max_agents: 6,
            ..OrchestratorConfig::default()
        };
        assert_eq!(capped.initial_pool().len(), 6);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = OrchestratorConfig {
            min_agents: 4,
            max_agents: 2,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(OrchestratorError::InvalidConfig(_))));
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_circuit_key_format() {
        assert_eq!(circuit_key("writer-1"), "agent:writer-1");
    }
}
