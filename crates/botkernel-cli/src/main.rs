//! Botkernel CLI - behavioral scheduling kernel for game agents.
//!
//! Single binary that provides:
//! - `botkernel run` - drive the kernel against a network adapter
//! - `botkernel status` - configuration and recent events
//! - `botkernel init` - write a default configuration

mod demo;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use botkernel_core::adapters::{LoopbackNetwork, Network, NetworkKind, ScriptedNetwork};
use botkernel_core::capabilities::EventLog;
use botkernel_core::observability::{EventEmitter, KernelEvent, KernelStatus, SchedulerEvent};
use botkernel_core::state::behaviors::{AUTO_ENABLED, START_REQUESTED};
use botkernel_core::state::TaskNode;
use botkernel_core::{AgentConfig, Dispatcher};

use crate::demo::DemoWorld;

#[derive(Parser)]
#[command(name = "botkernel")]
#[command(about = "Behavioral scheduling kernel for game agents", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the kernel
    Run {
        /// Stop after this many ticks (runs until Ctrl-C otherwise)
        #[arg(long)]
        ticks: Option<u64>,

        /// World to play against
        #[arg(long, value_enum)]
        script: Option<Script>,

        /// Network adapter: loopback or scripted
        #[arg(long, default_value = "loopback")]
        network: String,

        /// Loopback round trip in milliseconds
        #[arg(long, default_value_t = 30)]
        latency_ms: u64,

        /// Every nth loopback answer is a retryable failure (0 = never)
        #[arg(long, default_value_t = 0)]
        flaky: u64,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show configuration and recent events
    Status {
        /// Number of events to show
        #[arg(long, default_value_t = 10)]
        events: usize,
    },

    /// Initialize a new project
    Init,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Script {
    /// A monster fight, loot and an emergency retreat
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    let project_root = match cli.project {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Some(Commands::Run {
            ticks,
            script,
            network,
            latency_ms,
            flaky,
            json,
        }) => {
            let Some(kind) = NetworkKind::from_name(&network) else {
                bail!("Unknown network adapter `{network}` (expected loopback or scripted)");
            };
            let network = build_network(kind, Duration::from_millis(latency_ms), flaky);
            run_kernel(&project_root, network, ticks, script, json).await
        }
        Some(Commands::Status { events }) => show_status(&project_root, events),
        Some(Commands::Init) => init_project(&project_root),
        None => {
            println!("Botkernel - behavioral scheduling kernel");
            println!();
            println!("Usage: botkernel <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run       Run the kernel");
            println!("  status    Show configuration and recent events");
            println!("  init      Initialize a new project");
            println!();
            println!("Run 'botkernel --help' for more information.");
            Ok(())
        }
    }
}

fn build_network(kind: NetworkKind, latency: Duration, flaky: u64) -> Box<dyn Network> {
    match kind {
        NetworkKind::Loopback if flaky > 0 => Box::new(LoopbackNetwork::flaky(latency, flaky)),
        NetworkKind::Loopback => Box::new(LoopbackNetwork::new(latency)),
        NetworkKind::Scripted => Box::new(ScriptedNetwork::new()),
    }
}

async fn run_kernel(
    project_root: &Path,
    network: Box<dyn Network>,
    ticks: Option<u64>,
    script: Option<Script>,
    json: bool,
) -> Result<()> {
    tracing::info!(project = %project_root.display(), "Starting kernel");

    let mut config = AgentConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    let events = EventEmitter::new(&config.events.path);

    let mut kernel = Dispatcher::new(config, network).context("Failed to build state machine")?;
    if let Some(Script::Demo) = script {
        kernel = kernel.with_world(DemoWorld::new());
    }
    kernel
        .capabilities_mut()
        .register(EventLog::new(events))
        .context("Failed to register event log")?;

    let ctx = kernel.context_mut();
    ctx.set_flag(START_REQUESTED, true);
    ctx.set_flag(AUTO_ENABLED, true);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let ran = kernel.run(ticks, shutdown).await;
    tracing::info!(ticks = ran, state = %kernel.state(), "Kernel stopped");

    let status = kernel.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &KernelStatus) {
    println!("Botkernel Status");
    println!("================");
    println!();
    println!(
        "State: {} ({} ticks in state, tick {})",
        status.state, status.ticks_in_state, status.tick
    );
    println!(
        "Queue: {} pending, {} in flight{}",
        status.queue_depth,
        status.in_flight,
        if status.queue_paused { " (paused)" } else { "" }
    );
    if let Some(next) = &status.next_action {
        println!("Next action: {next}");
    }
    println!(
        "Actions: {} dispatched, {} succeeded, {} failed, {} retried",
        status.dispatcher.dispatched, status.queue.succeeded, status.queue.failed, status.queue.retried
    );
    println!(
        "Tasks: {} completed, {} failed, {} cancelled",
        status.task_stats.completed, status.task_stats.failed, status.task_stats.cancelled
    );
    for node in &status.tasks {
        print_task(node, 1);
    }
}

fn print_task(node: &TaskNode, depth: usize) {
    println!("{:indent$}- {} [{:?}] {}", "", node.id, node.status, node.name, indent = depth * 2);
    for child in &node.children {
        print_task(child, depth + 1);
    }
}

fn show_status(project_root: &Path, limit: usize) -> Result<()> {
    let mut config = AgentConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    let events = EventEmitter::new(&config.events.path);
    let recent = events.read_recent(limit);

    println!("Botkernel Status");
    println!("================");
    println!();
    println!("Project: {}", project_root.display());
    println!("Initial state: {}", config.state_machine.initial);
    println!("Tick interval: {}ms", config.tick.interval_ms);
    println!(
        "Queue: capacity {}, {} attempts per action",
        config.queue.capacity, config.queue.default_max_attempts
    );
    println!();
    println!("Recent events ({}):", events.path().display());
    if recent.is_empty() {
        println!("  (none)");
    }
    for event in &recent {
        println!("  {}", describe(event));
    }

    Ok(())
}

fn describe(event: &KernelEvent) -> String {
    let time = event.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
    let detail = match &event.event {
        SchedulerEvent::StateChanged { from, to, via } => match via {
            Some(via) => format!("{from} -> {to} via {via}"),
            None => format!("{from} -> {to}"),
        },
        SchedulerEvent::GuardFailed { transition, error, .. } => format!("{transition}: {error}"),
        SchedulerEvent::Task(task) => match &task.cause {
            Some(cause) => format!("{} {:?}: {cause}", task.task, task.status),
            None => format!("{} {:?}", task.task, task.status),
        },
        SchedulerEvent::ActionDispatched { action, handle } => format!("{action} as {handle}"),
        SchedulerEvent::ActionSettled { action, status, .. } => format!("{action} {status:?}"),
        SchedulerEvent::QueueOverflow { evicted } => format!("evicted {evicted}"),
        SchedulerEvent::ResultDiscarded { handle } => format!("late result for {handle}"),
    };
    format!("[{time}] #{} {} {}", event.tick, event.event.kind(), detail)
}

fn init_project(project_root: &Path) -> Result<()> {
    let botkernel_dir = project_root.join(".botkernel");
    std::fs::create_dir_all(&botkernel_dir)
        .with_context(|| format!("Failed to create {}", botkernel_dir.display()))?;

    let config_path = botkernel_dir.join("config.yaml");
    if !config_path.exists() {
        let default_config = r#"# Botkernel Configuration

tick:
  interval_ms: 100

queue:
  capacity: 100
  default_max_attempts: 3
  backoff:
    base_ticks: 1
    multiplier: 2
    max_ticks: 50
  execution_timeout_ticks: 300
  history: 50

tasks:
  default_max_retries: 3
  max_running_roots: 5
  history: 100

state_machine:
  initial: off
  history: 100
  default_behaviors: true

behavior:
  attack_auto: true
  attack_distance: 1.5
  auto_loot: true
  sit_auto: true
  heal_auto: true
  teleport_auto: false
  emergency_hp_percent: 20
  healed_hp_percent: 80
  healed_sp_percent: 50
  safe_distance: 5

events:
  path: .botkernel/events.jsonl
  recent: 64
"#;
        std::fs::write(&config_path, default_config)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    println!("Initialized Botkernel project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .botkernel/config.yaml - kernel configuration");
    println!();
    println!("Next steps:");
    println!("  1. Tune .botkernel/config.yaml");
    println!("  2. Run: botkernel run --script demo --ticks 150");

    Ok(())
}
