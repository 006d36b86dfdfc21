use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::agents::AgentOrchestrator;

/// Graceful shutdown coordinator for a running orchestrator
pub struct ShutdownCoordinator {
    orchestrator: Arc<AgentOrchestrator>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Arc<AgentOrchestrator>, grace_period: Duration) -> Self {
        Self {
            orchestrator,
            grace_period,
        }
    }

    /// Block until Ctrl-C, then shut down
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Stop the orchestrator, giving up after the grace period
    pub async fn shutdown(&self) -> Result<()> {
        info!(grace_period_ms = self.grace_period.as_millis() as u64, "Initiating graceful shutdown");

        if timeout(self.grace_period, self.orchestrator.stop()).await.is_err() {
            warn!("Orchestrator did not stop within the grace period");
            anyhow::bail!("Timeout waiting for orchestrator to stop");
        }

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
