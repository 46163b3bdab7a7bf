#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # line-bridge
//!
//! Bridges LINE webhook events to a locally running agent CLI, reachable from
//! the internet through a supervised quick tunnel.
//!
//! ## Subcommands
//!
//! - `line-bridge connect` — relay + tunnel, prints the binding link
//! - `line-bridge daemon` — same, logging only to the service log
//! - `line-bridge serve` — relay only (bring your own public endpoint)
//! - `line-bridge status` — stored state, cloud status, bound users
//! - `line-bridge logs` — tail of the service log
//! - `line-bridge disconnect` — forget the local binding
//!
//! ## API surface
//!
//! | Method | Path                   | Description                        |
//! |--------|------------------------|------------------------------------|
//! | GET    | `/`                    | Service identity                   |
//! | GET    | `/health`              | Liveness probe                     |
//! | GET    | `/status`              | Version and counters               |
//! | POST   | `<server.webhook_path>`| Relay one event to the agent       |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, tracing setup, signals
//! service.rs       — orchestration: relay, supervisor, coordinator, heartbeat
//! config.rs        — TOML + env-var configuration
//! routes/
//!   webhook.rs     — POST <webhook_path>
//!   health.rs      — GET /, /health, /status
//! agent/
//!   mod.rs         — request/response types, error kinds
//!   invoker.rs     — CLI invocation with timeout
//! tunnel/
//!   supervisor.rs  — lifecycle, liveness monitor, reconnection
//!   endpoint.rs    — spawn + endpoint scraping
//!   reconnect.rs   — bounded retry policy
//!   events.rs      — event set and broadcast channel
//! locate.rs        — executable discovery
//! process.rs       — captured runs, SIGTERM-then-SIGKILL
//! coordinator.rs   — coordination-service client
//! store.rs         — status record on disk
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use line_bridge::config::Config;
use line_bridge::service::{self, Bridge};

/// Number of lines printed by `logs`.
const LOG_TAIL: usize = 50;

/// Bridge LINE webhooks to a local agent CLI over a supervised tunnel.
#[derive(Parser)]
#[command(name = "line-bridge", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay and tunnel, then print the binding link.
    Connect,
    /// Like `connect`, but log only to the service log.
    Daemon,
    /// Run only the webhook relay.
    Serve,
    /// Show connection status.
    Status,
    /// Show the last lines of the service log.
    Logs,
    /// Forget the local binding.
    Disconnect,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Connect => run_bridge(config, true).await,
        Commands::Daemon => run_bridge(config, false).await,
        Commands::Serve => {
            init_tracing(&config, None, true);
            info!("line-bridge v{} starting (relay only)", env!("CARGO_PKG_VERSION"));
            service::serve(config, shutdown_token())
                .await
                .map_err(|e| e.to_string())
        }
        Commands::Status => status(config).await,
        Commands::Logs => logs(&config).await,
        Commands::Disconnect => disconnect(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` overrides `[logging] level`. Long-running modes also append a
/// plain-text copy to the service log.
fn init_tracing(config: &Config, log_file: Option<&Path>, console: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());

    let file_layer = log_file.and_then(|path| {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            ),
            Err(e) => {
                eprintln!("Cannot open log file {}: {e}", path.display());
                None
            }
        }
    });
    let console_layer = console.then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(console_layer)
        .with(file_layer)
        .init();
}

async fn run_bridge(config: Arc<Config>, console: bool) -> Result<(), String> {
    init_tracing(&config, Some(&service::log_path(&config)), console);
    info!("line-bridge v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = shutdown_token();

    println!("\nline-bridge v{}", env!("CARGO_PKG_VERSION"));
    let bridge = Bridge::new(config).map_err(|e| e.to_string())?;
    bridge
        .run(shutdown)
        .await
        .map_err(|e| e.to_string())
}

async fn status(config: Arc<Config>) -> Result<(), String> {
    init_tracing(&config, None, true);
    let bridge = Bridge::new(config).map_err(|e| e.to_string())?;
    println!("\nline-bridge status");
    println!("{}", "=".repeat(50));
    for line in bridge.status_report().await {
        println!("{line}");
    }
    Ok(())
}

async fn logs(config: &Config) -> Result<(), String> {
    let path = service::log_path(config);
    println!("\nline-bridge service log ({})", path.display());
    println!("{}", "=".repeat(50));
    match service::tail_lines(&path, LOG_TAIL).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No logs available");
            Ok(())
        }
        Err(e) => Err(format!("failed to read logs: {e}")),
    }
}

async fn disconnect(config: Arc<Config>) -> Result<(), String> {
    init_tracing(&config, None, true);
    let bridge = Bridge::new(config).map_err(|e| e.to_string())?;
    if bridge.disconnect().await.map_err(|e| e.to_string())? {
        println!("Local binding cleared");
    } else {
        println!("No local binding to clear");
    }
    println!("The binding still exists on the coordination service;");
    println!("block the bot in LINE to fully unbind.");
    Ok(())
}

/// Token cancelled on SIGINT or SIGTERM. Listeners are registered before
/// this returns, so a signal during startup is never lost to the default
/// action.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        tokio::spawn(async move {
            match (sigint, sigterm) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                (sigint, sigterm) => {
                    if let Err(e) = sigterm {
                        warn!("Cannot listen for SIGTERM: {e}");
                    }
                    match sigint {
                        Ok(mut sigint) => {
                            sigint.recv().await;
                            info!("Received SIGINT");
                        }
                        Err(e) => {
                            warn!("Cannot listen for SIGINT: {e}");
                            let _ = tokio::signal::ctrl_c().await;
                            info!("Received SIGINT");
                        }
                    }
                }
            }
            cancel.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
            cancel.cancel();
        });
    }
    token
}
