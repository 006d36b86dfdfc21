use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::agents::{OrchestratorConfig, WorkerConfig};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::election::ElectionConfig;
use crate::memory::MemoryConfig;
use crate::messaging::BrokerConfig;
use crate::tasks::DistributorConfig;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "agent-hive.toml";

/// Main configuration structure for agent-hive
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HiveConfig {
    pub observability: ObservabilityConfig,
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub broker: BrokerConfig,
    pub memory: MemoryConfig,
    pub election: ElectionConfig,
    pub distributor: DistributorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl HiveConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. `agent-hive.toml` in the working directory, if present
    /// 3. Environment variables (`AGENT_HIVE__SECTION__FIELD`)
    pub fn load() -> Result<Self> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        if default_file.exists() {
            Self::load_from(Some(default_file))
        } else {
            Self::load_from(None)
        }
    }

    /// Like `load`, reading `path` instead of the default file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!("Configuration file not found: {}", path.display());
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_HIVE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let hive_config: HiveConfig = builder.build()?.try_deserialize()?;
        hive_config.validate()?;
        Ok(hive_config)
    }

    /// Check cross-field rules the individual sections cannot see
    pub fn validate(&self) -> Result<()> {
        self.election.validate()?;
        self.orchestrator.validate()?;
        if self.broker.mailbox_capacity == 0 {
            bail!("broker.mailbox_capacity must be positive");
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker thresholds must be positive");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
