// Worker agents and the orchestrator that supervises them

pub mod executor;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod role;
pub mod worker;

pub use executor::{EchoExecutor, ExecutorFactory, TaskExecutor};
pub use lifecycle::{AgentStatus, LifecycleEvent, WorkerLifecycle};
pub use metrics::AgentMetrics;
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus};
pub use role::AgentRole;
pub use worker::{AgentWorker, WorkerConfig, WorkerSummary};
