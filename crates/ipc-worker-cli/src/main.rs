#![doc = include_str!("../README.md")]

mod config;
mod load;
mod telemetry;

use clap::Parser;
use config::{Backend, CliArgs, RunConfig};
use ipc_worker::{ShmPool, WorkerInfo, ZmqPool};
use load::{Replay, Report, drive};
use telemetry::init_telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let quit = config.pool.quit.clone();
    tokio::spawn(shutdown_signal(quit.clone()));

    let stream_len = config.stream_len;
    let factory = move |_: &WorkerInfo| Replay { stream_len };
    let report = match config.backend {
        Backend::Shm => {
            let mut pool = ShmPool::new(config.pool.clone(), factory)?;
            pool.start().await?;
            let report = drive(&pool, &config, &quit).await;
            pool.terminate();
            pool.join().await;
            report
        }
        Backend::Zmq => {
            let mut pool = ZmqPool::new(config.pool.clone(), factory)?;
            pool.start().await?;
            let report = drive(&pool, &config, &quit).await;
            pool.terminate();
            pool.join().await;
            report
        }
    };

    log_report(&config, &report);
    Ok(())
}

fn log_startup_info(config: &RunConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting load run with full config: {:#?}", config);
    } else {
        tracing::info!(
            backend = ?config.backend,
            workers = config.pool.worker_num,
            requests = config.requests,
            "Starting load run"
        );
    }
}

fn log_report(config: &RunConfig, report: &Report) {
    if report.completed < config.requests {
        tracing::warn!(
            completed = report.completed,
            requested = config.requests,
            "Run ended early"
        );
    }
    tracing::info!(
        backend = ?config.backend,
        completed = report.completed,
        fragments = report.fragments,
        elapsed = ?report.elapsed,
        "Throughput: {:.0} requests/s",
        report.requests_per_sec()
    );
}

async fn shutdown_signal(quit: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
        () = quit.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, stopping the pool...");
    quit.cancel();
}
