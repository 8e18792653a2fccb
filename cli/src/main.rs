//! Orchestrator CLI
//!
//! Drives the configured MCP stdio backends from the command line.
//!
//! Usage:
//!   orchestrator status
//!   orchestrator tools --backend sysinfo
//!   orchestrator call sysinfo get_uptime --args '{"human": true}'
//!   orchestrator batch calls.json --abort-on-failure
//!   orchestrator watch

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_stdio_backend::McpStdioFactory;
use tool_orchestrator::{BatchOptions, Orchestrator, OrchestratorConfig, ToolCall};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Route tool calls across MCP servers with health checks and circuit breaking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: orchestrator.toml in the working tree or user config dir)
    #[arg(long, short, env = "ORCHESTRATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, probe every backend and print a status report
    Status,
    /// List tools exposed by the backends
    Tools {
        /// Only list tools from this backend
        #[arg(long, short)]
        backend: Option<String>,
    },
    /// Call a single tool
    Call {
        /// Backend name
        backend: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, short)]
        args: Option<String>,
        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Retry transient failures
        #[arg(long)]
        idempotent: bool,
    },
    /// Run a JSON array of calls concurrently
    Batch {
        /// File holding the calls
        file: PathBuf,
        /// Cancel calls that have not started once one fails
        #[arg(long)]
        abort_on_failure: bool,
    },
    /// Keep the backends connected and print health on every check until Ctrl-C
    Watch,
}

/// Logs go to stderr; stdout carries JSON output only.
///
/// Set `LOG_FORMAT=json` for structured JSON logs. `RUST_LOG` overrides the
/// verbosity flag.
fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if use_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => OrchestratorConfig::load()?
            .context("No orchestrator.toml found; pass --config or set ORCHESTRATOR_CONFIG"),
    }
}

/// Parse `--args`; absent means an empty object
fn parse_args(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(json!({})),
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON"),
    }
}

fn read_batch(path: &Path) -> Result<Vec<ToolCall>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} must hold a JSON array of calls", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn status(orch: &Orchestrator) -> Result<Value> {
    let health = orch.health_check_all().await;
    let circuits: Vec<Value> = orch
        .circuit_snapshots()
        .into_iter()
        .map(|c| {
            json!({
                "backend": c.backend,
                "state": c.state,
                "consecutive_failures": c.consecutive_failures,
                "in_state_ms": c.last_transition.elapsed().as_millis() as u64,
            })
        })
        .collect();
    Ok(json!({
        "connections": serde_json::to_value(orch.connections())?,
        "health": serde_json::to_value(&health)?,
        "circuits": circuits,
        "stats": serde_json::to_value(orch.stats())?,
    }))
}

async fn tools(orch: &Orchestrator, backend: Option<&str>) -> Result<Value> {
    match backend {
        Some(name) => Ok(serde_json::to_value(orch.list_tools(name).await?)?),
        None => Ok(serde_json::to_value(orch.list_all_tools().await)?),
    }
}

async fn watch(orch: &Orchestrator) -> Result<Value> {
    let mut ticker = tokio::time::interval(orch.config().health_check_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                return Ok(serde_json::to_value(orch.stats())?);
            }
            _ = ticker.tick() => {
                let health = orch.health_check_all().await;
                println!("{}", serde_json::to_string(&health)?);
            }
        }
    }
}

/// Run one command inside a scoped orchestrator session. Returns whether
/// everything it ran succeeded.
async fn run(orch: &Orchestrator, command: Commands) -> Result<bool> {
    let outcome = orch
        .run_scoped(|orch| async move {
            match command {
                Commands::Status => status(&orch).await.map(|v| (v, true)),
                Commands::Tools { backend } => tools(&orch, backend.as_deref()).await.map(|v| (v, true)),
                Commands::Call {
                    backend,
                    tool,
                    args,
                    timeout_ms,
                    idempotent,
                } => {
                    let mut call = ToolCall::new(backend, tool, parse_args(args.as_deref())?);
                    if let Some(ms) = timeout_ms {
                        call = call.with_timeout(Duration::from_millis(ms));
                    }
                    if idempotent {
                        call = call.idempotent();
                    }
                    match orch.call(call).await {
                        Ok(result) => Ok((result.to_json(), true)),
                        Err(e) => Ok((json!({"error": e.to_string(), "error_kind": e.kind()}), false)),
                    }
                }
                Commands::Batch {
                    file,
                    abort_on_failure,
                } => {
                    let calls = read_batch(&file)?;
                    let mut options = BatchOptions::default().with_progress(|p| {
                        tracing::info!(
                            completed = p.completed,
                            total = p.total,
                            index = p.index,
                            success = p.success,
                            "Batch progress"
                        );
                    });
                    if abort_on_failure {
                        options = options.abort_on_failure();
                    }
                    let results = orch.call_tools_parallel_with(calls, options).await;
                    let ok = results.iter().all(|r| r.is_success());
                    let summary: Vec<Value> = results.iter().map(|r| r.to_json()).collect();
                    Ok((Value::Array(summary), ok))
                }
                Commands::Watch => watch(&orch).await.map(|v| (v, true)),
            }
        })
        .await?;

    let (value, ok) = outcome?;
    print_json(&value)?;
    Ok(ok)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = load_config(cli.config.as_deref())?;
    tracing::info!(backends = config.backends.len(), "Loaded orchestrator config");

    let orch = Orchestrator::new(config, Arc::new(McpStdioFactory))?;
    let ok = run(&orch, cli.command).await?;

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
