use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_hive::agents::{AgentOrchestrator, AgentRole, EchoExecutor};
use agent_hive::config::HiveConfig;
use agent_hive::election::read_leader_record;
use agent_hive::persistence::{JsonFileStore, SnapshotStore};
use agent_hive::priority::Priority;
use agent_hive::shutdown::ShutdownCoordinator;
use agent_hive::telemetry::{init_telemetry, shutdown_telemetry};

#[derive(Parser)]
#[command(name = "agent-hive")]
#[command(version)]
#[command(about = "Coordinate a pool of specialized worker agents")]
#[command(long_about = "agent-hive elects a single coordinator among running instances, keeps a pool \
                       of role-specific workers alive, and distributes prioritized tasks to them with \
                       acknowledged delivery, retries, and circuit breaking.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an orchestrator and run until Ctrl-C
    Run {
        /// Configuration file (defaults to agent-hive.toml when present)
        #[arg(long, help = "Path to a TOML configuration file")]
        config: Option<PathBuf>,
        /// Submit three sample tasks and print their results
        #[arg(long, help = "Submit research, extraction and writing demo tasks")]
        demo: bool,
    },
    /// Show the current leader record and shared memory summary
    Status {
        #[arg(long, help = "Path to a TOML configuration file")]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<HiveConfig> {
    HiveConfig::load_env_file()?;
    match path {
        Some(path) => HiveConfig::load_from(Some(path)),
        None => HiveConfig::load(),
    }
    .context("Failed to load configuration")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, demo } => {
            tokio::runtime::Runtime::new()?.block_on(async { run_command(config.as_deref(), demo).await })
        }
        Commands::Status { config } => {
            tokio::runtime::Runtime::new()?.block_on(async { status_command(config.as_deref()).await })
        }
        Commands::Config => config_command(),
    }
}

async fn run_command(config_path: Option<&Path>, demo: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_telemetry(&config.observability)?;

    let orchestrator =
        AgentOrchestrator::from_config(&config, EchoExecutor::factory(Duration::from_millis(200))).await?;
    let leader = orchestrator.start().await?;
    println!(
        "{} started as {}",
        orchestrator.agent_id(),
        if leader { "leader" } else { "follower" }
    );

    if demo {
        if leader {
            run_demo(&orchestrator).await?;
        } else {
            println!("Demo tasks are only submitted by the leader");
        }
    }

    let grace = Duration::from_millis(config.worker.stop_grace_ms) * 2;
    ShutdownCoordinator::new(Arc::clone(&orchestrator), grace)
        .wait_for_shutdown()
        .await?;
    shutdown_telemetry();
    Ok(())
}

async fn run_demo(orchestrator: &Arc<AgentOrchestrator>) -> Result<()> {
    let demo_tasks = [
        ("Research recent work on agent coordination", AgentRole::Researcher, Priority::High),
        ("Extract key findings from the sources", AgentRole::Extractor, Priority::Normal),
        ("Write a short summary of the findings", AgentRole::Writer, Priority::Normal),
    ];

    let mut submitted = Vec::new();
    for (description, role, priority) in demo_tasks {
        let task_id = orchestrator.submit_task(description, priority, Some(role), Map::new())?;
        submitted.push((task_id, role));
    }

    for (task_id, role) in submitted {
        let result = orchestrator.get_task_result(&task_id, Duration::from_secs(30)).await;
        let line = match result {
            Ok(Some(value)) => json!({ "task_id": task_id, "role": role, "result": value }),
            Ok(None) => json!({ "task_id": task_id, "role": role, "error": "timed out" }),
            Err(e) => json!({ "task_id": task_id, "role": role, "error": e.to_string() }),
        };
        println!("{}", serde_json::to_string_pretty(&line)?);
    }

    println!("{}", serde_json::to_string_pretty(&orchestrator.get_status())?);
    Ok(())
}

async fn status_command(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    let leader = read_leader_record(&config.election.lock_path)
        .with_context(|| format!("Failed to read {}", config.election.lock_path.display()))?;

    let memory = match &config.memory.snapshot_path {
        Some(path) => {
            let store = JsonFileStore::new(path);
            match store.load().await? {
                Some(snapshot) => {
                    let mut keys: Vec<&String> = snapshot.data.keys().collect();
                    keys.sort();
                    json!({
                        "snapshot_path": store.path(),
                        "keys": keys,
                        "updated_at": snapshot.updated_at,
                    })
                }
                None => json!({ "snapshot_path": store.path(), "keys": [] }),
            }
        }
        None => json!(null),
    };

    let status = json!({
        "lock_path": config.election.lock_path,
        "leader": leader,
        "shared_memory": memory,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn config_command() -> Result<()> {
    print!("{}", HiveConfig::default().to_toml()?);
    Ok(())
}
