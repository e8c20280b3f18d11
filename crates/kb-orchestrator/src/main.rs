use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kb_orchestrator::model::Board;
use kb_orchestrator::{
    NotificationHub, Orchestrator, OrchestratorConfig, PromptExecutor, Store,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kb-orchestrator", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE", default_value = "kb.toml")]
    config: PathBuf,

    /// JSON board snapshot to operate on
    #[arg(long, value_name = "FILE", default_value = "board.json")]
    board: PathBuf,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print statuses, tasks and agents
    Show,
    /// Move a task to another status and run the resulting orchestration
    Move {
        #[arg(long)]
        task: u64,
        #[arg(long)]
        status: u64,
    },
    /// Schedule a run for every task sitting in some agent's working status
    Rescan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = OrchestratorConfig::load(Some(&cli.config))
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let store = Arc::new(
        Store::load(&cli.board).with_context(|| format!("loading {}", cli.board.display()))?,
    );

    if let Command::Show = cli.command {
        let board = store.snapshot()?;
        print_board(&board);
        return Ok(());
    }

    let hub = Arc::new(NotificationHub::new(1024));
    let executor = PromptExecutor::new(Arc::new(config.transport()), config.retry_policy());
    let orchestrator = Orchestrator::start(
        Arc::clone(&store),
        executor,
        Arc::clone(&hub),
        config.orchestrator_options(),
    );
    if !config.base_instructions.trim().is_empty() {
        orchestrator.set_base_instructions(&config.base_instructions)?;
    }
    let mut events = orchestrator.subscribe();

    match cli.command {
        Command::Move { task, status } => {
            match orchestrator.move_task(task, status)? {
                Some(change) => println!(
                    "task {} moved {:?} -> {}",
                    change.task_id, change.from, change.to
                ),
                None => println!("task {task} already in status {status}"),
            }
        }
        Command::Rescan => {
            let queued = orchestrator.rescan()?;
            println!("queued {} run(s): {:?}", queued.len(), queued);
        }
        Command::Show => {}
    }

    orchestrator.wait_idle().await;
    drain_events(&mut events);

    store
        .save(&cli.board)
        .with_context(|| format!("saving {}", cli.board.display()))?;
    Ok(())
}

fn drain_events(events: &mut broadcast::Receiver<kb_orchestrator::Event>) {
    loop {
        match events.try_recv() {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!("unprintable event: {}", err),
            },
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event output lagged");
            }
            Err(_) => break,
        }
    }
}

fn print_board(board: &Board) {
    for project in board.projects.values() {
        println!("# {} (#{})", project.name, project.id);
        for status in board
            .statuses
            .values()
            .filter(|status| status.project_id == project.id)
        {
            println!("  [{}] {} {}", status.id, status.name, status.color);
            for task in board
                .tasks
                .values()
                .filter(|task| task.status_id == status.id)
            {
                let holder = board
                    .holder_of(task.id)
                    .map(|agent| format!(" <- {}", agent.name))
                    .unwrap_or_default();
                println!(
                    "    #{} {} ({} message(s)){}",
                    task.id,
                    task.title,
                    board.messages_for(task.id).count(),
                    holder
                );
            }
        }
        for agent in board
            .agents
            .values()
            .filter(|agent| agent.project_id == project.id)
        {
            println!(
                "  agent {} (#{}) watches {} -> ok: {} / err: {}, holds {:?}",
                agent.name,
                agent.id,
                agent
                    .working_status
                    .map(|id| board.status_name(id))
                    .unwrap_or("-"),
                agent
                    .success_status
                    .map(|id| board.status_name(id))
                    .unwrap_or("-"),
                agent
                    .error_status
                    .map(|id| board.status_name(id))
                    .unwrap_or("-"),
                agent.current_task
            );
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
