pub mod distributor;
pub mod types;

pub use distributor::{DistributorConfig, DistributorError, RetryOutcome, TaskDistributor, WorkerCandidate};
pub use types::{AgentTask, TaskError, TaskStatus};
