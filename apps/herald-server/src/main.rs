//! # Herald Server
//!
//! Runs the admin push endpoint.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Herald Server                                   │
//! │                                                                         │
//! │  Admin console ───► GET /admin/events (8080) ───► HubServer            │
//! │                                                      │                  │
//! │  Operator      ───► POST /admin/events ──► EventBus ─┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//! - `herald-server` - serve until SIGINT/SIGTERM
//! - `herald-server issue-token <user-id>` - print an admin session token
//!   signed with the configured secret (development only)
//!
//! The config file path may be given with `HERALD_CONFIG`; otherwise the
//! platform default `herald.toml` is used when present.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use herald_bus::admission::ADMIN_ROLE;
use herald_bus::{HeraldConfig, HubServer, JwtAdmission};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::var_os("HERALD_CONFIG").map(PathBuf::from);
    let config = HeraldConfig::load(config_path).context("Failed to load configuration")?;

    let admission = JwtAdmission::from_settings(&config.auth);

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => {}
        Some("issue-token") => {
            let user_id = args.next().unwrap_or_else(|| "admin".to_string());
            println!("{}", admission.issue(&user_id, ADMIN_ROLE)?);
            return Ok(());
        }
        Some(other) => bail!("Unknown command: {} (expected: issue-token <user-id>)", other),
    }

    info!("Starting Herald server...");
    if config.auth.uses_dev_secret() {
        warn!("Using the development JWT secret; set HERALD_JWT_SECRET in production");
    }
    info!(
        addr = %config.server.bind_address(),
        path = %config.server.events_path,
        heartbeat_secs = config.push.heartbeat_interval_secs,
        "Configuration loaded"
    );

    let hub = HubServer::new(&config, Arc::new(admission)).start().await?;
    info!(addr = %hub.local_addr(), "Herald server listening");

    shutdown_signal().await;
    hub.shutdown().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
