use std::{env, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use kb_sandbox::{
    server_registry, McpServer, OpenAiBackend, SandboxOptions, DEFAULT_COMMAND_TIMEOUT_SECS,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kb-sandbox-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Sandbox directory (falls back to KB_SANDBOX_DIR, then ./sandbox)
    #[arg(long = "root", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Default timeout for run_cmd and run_git
    #[arg(long = "command-timeout-secs", value_name = "SECS")]
    command_timeout_secs: Option<u64>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let root = args
        .root
        .or_else(|| env::var_os("KB_SANDBOX_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("sandbox"));
    let options = SandboxOptions {
        root,
        command_timeout: Duration::from_secs(
            args.command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        ),
    };

    let backend = match env::var("KB_OPENAI_BASE_URL") {
        Ok(url) if !url.trim().is_empty() => OpenAiBackend::new(url),
        _ => OpenAiBackend::default(),
    };

    let registry = server_registry(&options, Arc::new(backend)).with_context(|| {
        format!(
            "failed to open sandbox root {}",
            options.root.display()
        )
    })?;
    tracing::info!(
        root = %options.root.display(),
        tools = ?registry.names(),
        "kb-sandbox-server {}",
        env!("CARGO_PKG_VERSION")
    );

    McpServer::new(registry).serve_stdio().await
}

// stdout carries the protocol, so logs go to stderr.
fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
