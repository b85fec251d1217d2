#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # paneld
//!
//! Persistent shell sessions for a multi-pane UI, plus a human-in-the-loop
//! permission broker for AI task runners.
//!
//! Each UI pane maps to at most one live shell. Output is buffered so a pane
//! that reconnects gets the recent tail back; idle shells are reaped. Task
//! runners long-poll `/api/permissions` and block until an operator allows
//! or denies the tool call from the UI.
//!
//! ## Subcommands
//!
//! - `paneld serve` (default): run the HTTP/WS server
//! - `paneld shells`: print the shells detected on this machine
//!
//! ## API surface
//!
//! | Method | Path                     | Auth  | Description                         |
//! |--------|--------------------------|-------|-------------------------------------|
//! | GET    | `/api/health`            | No    | Liveness probe                      |
//! | GET    | `/api/ws`                | Yes*  | UI WebSocket (sessions, prompts)    |
//! | POST   | `/api/permissions`       | Yes   | Long-poll a permission decision     |
//! | POST   | `/api/runs/{run_id}/end` | Yes   | Deny a run's pending permissions    |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization` header
//! available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! config.rs        TOML + env-var configuration
//! auth.rs          Bearer token middleware, constant-time comparison
//! events.rs        UI event channel
//! state.rs         AppState shared by handlers
//! routes/
//!   health.rs      GET /api/health
//!   permissions.rs POST /api/permissions, POST /api/runs/{run_id}/end
//! ws/
//!   mod.rs         WebSocket upgrade and message dispatch
//! sessions/
//!   buffer.rs      bounded replay buffer
//!   session.rs     ManagedSession (process group, PTY, exit watcher)
//!   reaper.rs      per-session idle timer
//!   mod.rs         SessionRegistry (pane mapping, lifecycle)
//! permissions/
//!   decision.rs    request / response / decision types
//!   mod.rs         PermissionBroker
//! shell/
//!   process.rs     spawn_shell_pgroup()
//!   pty.rs         PTY allocation, spawn, resize
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use paneld::{routes, AppState, Config};

/// Persistent pane shells and a permission broker for AI task runners.
#[derive(Parser)]
#[command(name = "paneld", version)]
struct Cli {
    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
    /// List shells detected on this machine.
    Shells,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Shells) => {
            for shell in paneld::shell::detect_shells() {
                println!("{shell}");
            }
        }
        Some(Commands::Serve) | None => {
            if let Err(e) = run_server(cli.config.as_deref()).await {
                eprintln!("paneld: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("paneld v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set PANELD_API_KEY or update config");
    }

    let state = AppState::new(config);
    let opts = state.registry.options();
    info!(
        "Sessions: shell {}, {}, buffer {}, idle timeout {:?}, max {}",
        opts.shell,
        if opts.pty { "pty" } else { "pipe" },
        opts.buffer_size,
        opts.idle_timeout,
        opts.max_sessions
    );

    let app = routes::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen).await?;

    info!("Server ready");

    // Long-polls hold their connections open, so pending permissions must be
    // denied before the server can drain.
    let broker = state.broker.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        broker.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.registry.kill_all().await;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
