//! haraltd - Bluetooth daemon.
//!
//! Run with: `cargo run -p haraltd-service -- server start`

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use haraltd_service::{Config, Daemon};

/// haraltd - Bluetooth daemon serving clients over a local socket.
#[derive(Parser, Debug)]
#[command(name = "haraltd")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `haraltd=debug` (overrides config).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Control the daemon.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Run the daemon in the foreground (default behavior).
    Start {
        /// Socket path (overrides config).
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let socket = match args.command {
        Some(Command::Server {
            action: ServerAction::Start { socket },
        }) => socket,
        None => None,
    };
    run_server(args.config, args.log_level, socket).await
}

async fn run_server(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    socket: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args
    if let Some(socket) = socket {
        config.server.socket_path = socket;
    }
    if let Some(level) = log_level {
        config.log.level = Some(level);
    }
    config.validate()?;

    // Initialize logging
    let mut filter = EnvFilter::from_default_env().add_directive("haraltd=info".parse()?);
    if let Some(level) = &config.log.level {
        filter = filter.add_directive(level.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), backend = ?config.stack.backend, "Starting haraltd");
    let daemon = Daemon::new(config);
    daemon.run(shutdown_signal()).await?;
    info!("haraltd stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
