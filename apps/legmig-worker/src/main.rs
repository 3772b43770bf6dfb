use anyhow::Result;
use clap::Parser;
use legmig_core::{load_or_default, run_worker, ExitReason, Operator};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "legmig-worker",
    version,
    about = "Claim pending migration batches and run them"
)]
struct Args {
    /// Config file (defaults to $LEGMIG_CONFIG, then ./legmig.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stop after dispatching this many batches (0 = unlimited)
    #[arg(long)]
    max_jobs: Option<u64>,
    /// Stop once resident memory reaches this many MB
    #[arg(long)]
    memory: Option<u64>,
}

#[tokio::main]
async fn main() {
    legmig_otel::init();
    let args = Args::parse();
    match run(args).await {
        Ok(reason) => info!(?reason, "worker stopped"),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<ExitReason> {
    let (mut cfg, path) = load_or_default(args.config.as_deref())?;
    if let Some(p) = &path {
        info!(config = %p.display(), "config loaded");
    }
    if let Some(max_jobs) = args.max_jobs {
        cfg.worker.max_jobs = Some(max_jobs);
    }
    if let Some(memory) = args.memory {
        cfg.worker.memory_mb = Some(memory);
    }
    let op = Operator::from_config(&cfg)?;
    if op.registry().is_empty() {
        warn!("no migrators registered; claimed batches will fail");
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    run_worker(&cfg, op.machine().clone(), op.registry().clone(), rx).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; listening for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
