//! dvid-gateway: connection gateway for the dvid messenger.
//!
//! Accepts WebSocket clients, routes their CBOR requests to handlers, and
//! pushes new chats and messages to every connection of the affected users.

mod backend;
mod config;
mod connection;
mod dispatcher;
mod handler;
mod notifier;
mod registry;
mod route;
mod server;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::GatewayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// dvid-gateway: messenger connection gateway
#[derive(Parser, Debug)]
#[command(name = "dvid-gateway", version, about = "Messenger connection gateway")]
struct Cli {
    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket upgrade path
    #[arg(long)]
    ws_path: Option<String>,

    /// Per-request handler deadline in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.dvid/gateway.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(
        Some(&config_path),
        Overrides {
            host: cli.host,
            port: cli.port,
            ws_path: cli.ws_path,
            request_timeout_ms: cli.request_timeout_ms,
            log_level: cli.log_level,
        },
    );

    // Initialize tracing; RUST_LOG takes precedence over the configured level.
    use tracing_subscriber::EnvFilter;
    let level = match &config {
        Ok(cfg) => cfg.log_level.clone(),
        Err(_) => "info".to_string(),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        "starting dvid-gateway"
    );

    let write_wait = config.connection.write_wait;
    let server = Arc::new(GatewayServer::new(config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown();
    server.drain(write_wait * 2).await;

    info!("dvid-gateway stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
