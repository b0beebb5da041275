use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use dist_workflow_scheduler::domain::alert::alert_channel::{AlertChannel, LogAlertChannel};
use dist_workflow_scheduler::domain::alert::alert_server::AlertServer;
use dist_workflow_scheduler::domain::clock::SystemClock;
use dist_workflow_scheduler::domain::config::{ClusterConfig, LoggingConfig};
use dist_workflow_scheduler::domain::dag::workflow_dag::WorkflowDag;
use dist_workflow_scheduler::domain::engine::events::WorkflowSnapshot;
use dist_workflow_scheduler::domain::master::master_server::MasterServer;
use dist_workflow_scheduler::domain::model::task_instance::TaskState;
use dist_workflow_scheduler::domain::model::workflow_instance::{TriggerType, WorkflowState};
use dist_workflow_scheduler::domain::registry::memory_registry::{MemoryCoordinator, MemoryRegistry};
use dist_workflow_scheduler::domain::registry::registry_client::RegistryClient;
use dist_workflow_scheduler::domain::store::memory_store::MemoryMetadataStore;
use dist_workflow_scheduler::domain::utils::statistics::StatsCollector;
use dist_workflow_scheduler::domain::worker::plugin_registry::TaskPluginRegistry;
use dist_workflow_scheduler::domain::worker::worker_server::WorkerServer;
use dist_workflow_scheduler::{load_cluster_config, load_workflow_definition, logger};

const LOCALHOST: &str = "127.0.0.1";

#[derive(Parser, Debug)]
#[command(name = "dws", version, about = "Distributed workflow scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parses and validates a workflow definition and prints its execution order.
    Validate {
        #[arg(long)]
        workflow: String,
    },
    /// Runs a workflow on an in-process cluster: one master, N workers and an alert server.
    Standalone {
        #[arg(long)]
        workflow: String,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Give up waiting for the workflow after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { workflow } => {
            logger::init(&LoggingConfig::default());
            validate(&workflow)
        }
        Command::Standalone { workflow, config, workers, timeout_secs } => {
            let config = load_cluster_config(config.as_deref()).context("loading cluster config")?;
            logger::init(&config.logging);
            standalone(&workflow, config, workers, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn validate(path: &str) -> anyhow::Result<()> {
    let definition = load_workflow_definition(path).with_context(|| format!("loading workflow '{}'", path))?;
    let dag = WorkflowDag::build(&definition)?;

    println!("{} {} v{} ({} tasks, {} relations)", "valid".green().bold(), definition.code, definition.version, dag.len(), definition.relations.len());
    for (position, code) in dag.topological_order().iter().enumerate() {
        println!("  {:>3}. {}", position + 1, code);
    }
    Ok(())
}

async fn standalone(path: &str, mut config: ClusterConfig, workers: usize, timeout: Duration) -> anyhow::Result<()> {
    let definition = load_workflow_definition(path).with_context(|| format!("loading workflow '{}'", path))?;

    // Everything runs on one host, let the OS pick the ports.
    config.master.listen_port = 0;
    config.worker.listen_port = 0;
    config.alert.listen_port = 0;

    let stats = match &config.logging.stats_file {
        Some(file) => StatsCollector::to_file(file).with_context(|| format!("opening stats file '{}'", file))?,
        None => StatsCollector::disabled(),
    };
    let clock = SystemClock::shared();
    let store = MemoryMetadataStore::shared();
    let coordinator = MemoryCoordinator::new(config.registry.session_timeout);
    let reaper_shutdown = CancellationToken::new();
    let reaper = coordinator.start_reaper(config.registry.reaper_interval, reaper_shutdown.clone());
    let session = || -> Arc<dyn RegistryClient> { Arc::new(MemoryRegistry::connect(&coordinator)) };

    let alert_server = if config.alert.enabled {
        let channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogAlertChannel)];
        Some(AlertServer::start(&config, LOCALHOST, session(), channels, clock.clone()).await?)
    } else {
        None
    };

    let mut worker_servers = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        let plugins = Arc::new(TaskPluginRegistry::with_defaults());
        worker_servers.push(WorkerServer::start(&config, LOCALHOST, session(), clock.clone(), plugins).await?);
    }
    let master = MasterServer::start(&config, LOCALHOST, session(), store, clock, stats.clone()).await?;

    let id = master.engine().trigger(definition, TriggerType::Manual, BTreeMap::new())?;
    println!("Triggered workflow instance {}", id.to_string().bold());

    let state = master.engine().wait_for_terminal(&id, timeout).await?;
    let snapshot = master.engine().snapshot(&id).await?;
    print_summary(&snapshot);

    master.shutdown().await;
    for worker in worker_servers {
        worker.shutdown().await;
    }
    if let Some(alert_server) = alert_server {
        alert_server.shutdown().await;
    }
    reaper_shutdown.cancel();
    let _ = reaper.await;
    stats.close();

    match state {
        WorkflowState::Succeeded => Ok(()),
        state => bail!("workflow {} ended in state {:?}", id, state),
    }
}

fn print_summary(snapshot: &WorkflowSnapshot) {
    let workflow = &snapshot.workflow;
    let state = format!("{:?}", workflow.state);
    let state = match workflow.state {
        WorkflowState::Succeeded => state.green().bold(),
        WorkflowState::Failed => state.red().bold(),
        _ => state.yellow().bold(),
    };
    println!("\nWorkflow {} ({}): {}", workflow.id, workflow.definition_code, state);
    if let Some(node) = &workflow.first_failed_node {
        println!("  first failed node: {}", node.to_string().red());
    }

    for task in &snapshot.tasks {
        let task_state = format!("{:?}", task.state);
        let task_state = match task.state {
            TaskState::Succeeded => task_state.green(),
            TaskState::Failed | TaskState::Killed => task_state.red(),
            _ => task_state.yellow(),
        };
        let duration = match (task.start_time, task.end_time) {
            (Some(start), Some(end)) => format!("{} ms", end - start),
            _ => "-".to_string(),
        };
        let host = task.host.as_ref().map(|h| h.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {:<20} {:<10} attempt {:<2} {:<22} {}", task.node_code, task_state, task.attempt, host, duration);
    }

    let summary = &snapshot.summary;
    println!(
        "\n  {} succeeded, {} failed, {} killed, {} skipped, {} unfinished of {}",
        summary.succeeded, summary.failed, summary.killed, summary.skipped, summary.unfinished, summary.total
    );
}
