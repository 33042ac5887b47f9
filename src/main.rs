//! # Toolgate
//!
//! A tool-calling gateway: discovers tools from MCP servers, synthesizes a
//! script-callable helper API, and executes model-authored scripts in a
//! network-restricted sandbox that can only reach the gateway's own proxy.

mod config;
mod enrich;
mod error;
mod helpers;
mod mcp;
mod metrics;
mod resolve;
mod sandbox;
mod schema;
mod server;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::AppConfig;
use crate::mcp::ConnectionManager;
use crate::metrics::ToolMetrics;
use crate::server::GatewayState;

#[derive(Parser)]
#[command(name = "toolgate", about = "Tool-calling gateway with sandboxed script execution")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "data/config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration; a missing file means defaults (open dev mode).
    let config = AppConfig::load(&cli.config)?;

    // 2. Logging: everything to the session log file, info+ to stdout.
    if !std::path::Path::new("data").exists() {
        fs::create_dir("data").context("Failed to create data directory")?;
    }
    let log_path = std::path::Path::new("data/session.log");
    if log_path.exists() {
        let _ = fs::remove_file(log_path);
    }
    let file_appender = tracing_appender::rolling::never("data", "session.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper=warn,rmcp=warn"));

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    tracing::info!(config = %cli.config, "Starting toolgate");

    // 3. Shared state: metrics store, connection cache and its sweeper.
    let metrics = Arc::new(ToolMetrics::new());
    let state = Arc::new(
        GatewayState::new(config.clone(), Arc::clone(&metrics))
            .context("Failed to build gateway state")?,
    );
    ConnectionManager::spawn_sweeper(
        state.cache(),
        Duration::from_secs(config.cache.sweep_secs),
    );

    // 4. Serve until killed.
    server::run(state).await
}
