//! courier - run workers and inspect the task store
//!
//! ```bash
//! courier run
//! courier submit notify '{"target":"chat-1","message":"hi"}' --key order-42
//! courier dead-letters --kind notify
//! courier replay task-01H...
//! courier stats
//! ```
//!
//! Set `store_path` in `courier.toml` (or `COURIER__STORE_PATH`) to a SQLite
//! file to share tasks between invocations and between a running `courier
//! run` and the admin commands; without it the store lives in memory.

mod demo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use courier_core::domain::{NewTask, Priority, TaskId, TaskKind};
use courier_core::impls::open_store;
use courier_core::{App, AppBuilder, CourierConfig};

use crate::demo::{Notify, NotifyHandler};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Reliable background job dispatch")]
struct Cli {
    /// Config file (defaults to ./courier.toml when present)
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run workers until Ctrl-C
    Run,
    /// Submit a task
    Submit {
        kind: String,
        /// JSON payload
        payload: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Hold the task back for this many milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Print one task as JSON
    Show { id: TaskId },
    /// List dead-lettered tasks
    DeadLetters {
        #[arg(long)]
        kind: Option<String>,
    },
    /// Move a dead-lettered (or failed) task back to pending
    Replay { id: TaskId },
    /// Mark a dead-lettered task as failed for good
    Discard { id: TaskId },
    /// Queue depth per state
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_app(config: CourierConfig) -> Result<App> {
    let store = open_store(config.store_path.as_deref())
        .await
        .context("failed to open task store")?;
    let app = AppBuilder::new(config)
        .with_store(store)
        .register::<Notify, _>(NotifyHandler)?
        .expect_kinds(&["notify"])
        .build()?;
    Ok(app)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = CourierConfig::load(cli.config.as_deref()).context("failed to load config")?;
    let app = build_app(config).await?;

    match cli.command {
        Command::Run => {
            let orchestrator = app.start();
            tracing::info!(workers = orchestrator.workers(), "courier running, Ctrl-C to stop");
            let report = orchestrator
                .run_until(async {
                    // Ctrl-C が取れない環境ではそのまま停止
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %err, "failed to listen for ctrl-c");
                    }
                })
                .await?;
            tracing::info!(
                drained = report.drained,
                abandoned = report.abandoned,
                released = report.released.len(),
                "courier stopped"
            );
        }
        Command::Submit {
            kind,
            payload,
            key,
            priority,
            delay_ms,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut task = NewTask::new(kind, payload).with_priority(priority.into());
            if let Some(key) = key {
                task = task.with_idempotency_key(key);
            }
            if let Some(ms) = delay_ms {
                task = task.with_delay(Duration::from_millis(ms));
            }
            let id = app.producer().submit_task(task).await?;
            println!("{id}");
        }
        Command::Show { id } => {
            let row = app.admin().get_task(id).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Command::DeadLetters { kind } => {
            let kind = kind.map(TaskKind::new);
            let rows = app.admin().list_dead_lettered(kind.as_ref()).await?;
            if rows.is_empty() {
                println!("no dead-lettered tasks");
            }
            for row in rows {
                println!(
                    "{}  {}  attempts={}  reason={}",
                    row.id,
                    row.kind,
                    row.attempt_count,
                    row.dead_letter_reason.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Replay { id } => {
            app.admin().replay(id).await?;
            println!("{id} replayed");
        }
        Command::Discard { id } => {
            app.admin().discard(id).await?;
            println!("{id} discarded");
        }
        Command::Stats { json } => {
            let status = app.admin().status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{status}");
            }
        }
    }

    Ok(())
}
