//! CLI entry point for the HandBrake queue daemon
//!
//! Parses command line arguments, loads the configuration and queue state,
//! then serves the JSON routes until Ctrl-C.

use clap::Parser;
use handbrake_queue::{run_server, Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HandBrake Queue - persistent transcoding queue for HandBrakeCLI
#[derive(Parser, Debug)]
#[command(name = "handbrake-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Queue state document, overrides `state_file`
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// HTTP port, overrides `listen_port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip startup checks (encoder, root folder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handbrake_queue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), "HandBrake queue starting");

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(state_file) = args.state_file {
        config.main.state_file = state_file;
    }
    if let Some(port) = args.port {
        config.main.listen_port = port;
    }
    let port = config.main.listen_port;

    let daemon_result = if args.skip_checks {
        tracing::warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config).await
    } else {
        Daemon::new(config).await
    };

    let handle = match daemon_result {
        Ok((daemon, handle)) => {
            daemon.spawn();
            handle
        }
        Err(e) => {
            tracing::error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run_server(handle, port, shutdown_signal()).await {
        tracing::error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
