// agent-hive library - elected coordinator, worker pool, and task distribution
// This exposes the core components for testing and integration

pub mod agents;
pub mod circuit_breaker;
pub mod config;
pub mod election;
pub mod memory;
pub mod messaging;
pub mod observability;
pub mod persistence;
pub mod priority;
pub mod retry;
pub mod shutdown;
pub mod tasks;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{
    AgentMetrics, AgentOrchestrator, AgentRole, AgentStatus, AgentWorker, EchoExecutor, ExecutorFactory,
    OrchestratorConfig, OrchestratorError, OrchestratorStatus, TaskExecutor, WorkerConfig,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitInfo, CircuitState};
pub use config::{HiveConfig, ObservabilityConfig};
pub use election::{ElectionConfig, ElectionError, LeaderElection, LeaderRecord};
pub use memory::{MemoryConfig, MemoryError, SharedMemory};
pub use messaging::{BrokerConfig, Message, MessageBroker, MessageType};
pub use observability::{CoordinationMetrics, OperationTimer};
pub use persistence::{JsonFileStore, MemorySnapshot, PersistenceError, SnapshotStore};
pub use priority::Priority;
pub use retry::{BackoffPolicy, Jitter};
pub use shutdown::ShutdownCoordinator;
pub use tasks::{AgentTask, DistributorConfig, TaskDistributor, TaskError, TaskStatus};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
