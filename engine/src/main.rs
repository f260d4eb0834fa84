use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use quarry_core::{run_worker_loop, EngineConfig, WorkerContext};
use quarry_observability::{init_logging, ProcessKind};
use quarry_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "quarry-engine")]
#[command(about = "Headless Quarry hunt backend")]
struct Cli {
    /// Directory for JSON log files; console-only when absent.
    #[arg(long, env = "QUARRY_LOGS_DIR", global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API with an in-process hunt worker.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Number of in-process worker loops competing for jobs.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Accept hunts over HTTP but leave execution to `work` processes.
        #[arg(long, default_value_t = false)]
        no_worker: bool,
    },
    /// Run a worker-only process (no HTTP listener).
    Work {
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let process = match cli.command {
        Command::Serve { .. } => ProcessKind::Server,
        Command::Work { .. } => ProcessKind::Worker,
    };
    let (_log_guard, log_info) = init_logging(process, cli.logs_dir.clone())?;
    info!(process = %log_info.process, "logging initialized");

    let config = EngineConfig::from_env();
    let state = AppState::build(config);
    let shutdown = CancellationToken::new();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            workers,
            no_worker,
        } => {
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            if !no_worker {
                spawn_workers(&state, workers.max(1), &shutdown);
            }
            serve(addr, state).await?;
        }
        Command::Work { workers } => {
            let handles = spawn_workers(&state, workers.max(1), &shutdown);
            tokio::signal::ctrl_c().await?;
            info!("shutting down workers");
            shutdown.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
    Ok(())
}

fn spawn_workers(
    state: &AppState,
    count: usize,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let ctx = WorkerContext::new(
                state.engine.clone(),
                state.jobs.clone(),
                state.heartbeats.clone(),
            );
            let ctx = if count > 1 {
                let consumer_id = format!("{}:{i}", ctx.consumer_id);
                ctx.with_consumer_id(consumer_id)
            } else {
                ctx
            };
            tokio::spawn(run_worker_loop(ctx, shutdown.clone()))
        })
        .collect()
}
