//! Cluster Node - Main Entry Point
//!
//! Loads the node configuration, registers the node protocol and runs the
//! listeners and master uplink until a shutdown signal arrives.

mod cli;
mod config;
mod logging;
mod protocol;
mod signals;

use anyhow::Result;
use cli::CliArgs;
use cluster_net::{HookError, Processor, Server, ServerConfig, ServerHooks, SessionRef};
use config::AppConfig;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let startup_start = Instant::now();
    let args = CliArgs::parse();

    // Configuration comes first so the log level can be taken from it
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config: {:#}", e))?;
    config.apply_cli(&args)?;
    if let Err(e) = config.validate() {
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    logging::setup_logging(&config.logging)?;
    info!("Starting cluster node v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", args.config_path.display());

    let processor = Arc::new(Processor::new());
    protocol::register(&processor).map_err(|e| anyhow::anyhow!("Failed to register protocol: {}", e))?;

    let server_config = config.to_server_config();
    log_server_configuration(&server_config);

    let server = Server::new(server_config, processor).with_hooks(node_hooks());
    info!("Startup complete in {:.2?}", startup_start.elapsed());

    server
        .run(async {
            if let Err(e) = signals::wait_for_shutdown().await {
                error!("Signal handler failed: {}", e);
            }
        })
        .await?;

    info!("👋 Cluster node stopped");
    Ok(())
}

fn node_hooks() -> ServerHooks {
    ServerHooks {
        on_connected: Some(Arc::new(|session: &SessionRef| {
            info!("🔌 Peer connected: {}", session.remote_addr());
        })),
        on_disconnected: Some(Arc::new(|session: &SessionRef| -> Result<(), HookError> {
            info!("Peer disconnected: {}", session.remote_addr());
            Ok(())
        })),
        on_master_connected: Some(Arc::new(|session: &SessionRef| {
            protocol::send_ping(session);
        })),
    }
}

fn log_server_configuration(config: &ServerConfig) {
    info!("📋 Configuration Summary:");
    info!("  🎭 Role: {}", config.role);
    if !config.tcp_addr.is_empty() {
        info!("  🌐 TCP address: {}", config.tcp_addr);
    }
    if !config.ws_addr.is_empty() {
        let scheme = if config.uses_tls() { "wss" } else { "ws" };
        info!("  🌐 WebSocket address: {}://{}", scheme, config.ws_addr);
    }
    if config.wants_uplink() {
        info!("  🔗 Master: {}", config.master_addr);
    }
    info!("  👥 Max connections: {}", config.max_conn_num);
    info!("  📦 Max message length: {} bytes", config.max_msg_len);
}
