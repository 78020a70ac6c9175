//! skyhost daemon - hosts game servers on this node

use anyhow::{Context, Result};
use clap::Parser;
use skyhost_core::DaemonConfig;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod handlers;

use daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "skyhostd", version, about = "skyhost daemon - game server host")]
struct Args {
    /// Config file (.toml, .yaml, .yml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket to listen on, overriding the config
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "skyhostd=info,skyhost=info".into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "skyhostd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (mut config, config_path) = DaemonConfig::discover(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    let _guard = init_tracing(config.log_dir.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "skyhost daemon starting");
    match &config_path {
        Some(path) => info!(config = %path.display(), "config loaded"),
        None => info!("no config file, using defaults"),
    }

    if config.socket_path.exists() {
        match tokio::net::UnixStream::connect(&config.socket_path).await {
            Ok(_) => {
                error!(socket = %config.socket_path.display(), "daemon is already running");
                std::process::exit(1);
            }
            Err(_) => {
                info!("removing stale socket file");
                std::fs::remove_file(&config.socket_path)?;
            }
        }
    }

    let daemon = Daemon::new(config).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        result = daemon.run() => {
            if let Err(e) = result {
                error!(error = %e, "daemon error");
                daemon.shutdown().await;
                return Err(e.into());
            }
        }
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    daemon.shutdown().await;
    info!("daemon shutdown complete");
    Ok(())
}
