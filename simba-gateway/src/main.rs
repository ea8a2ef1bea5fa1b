//! Simba gateway — entry point.
//!
//! ```text
//! simba-gateway                         Run with env/default config
//! simba-gateway --ws-port 9090          Override the WebSocket port
//! simba-gateway --adb /path/to/adb      Explicit adb binary
//! RUST_LOG=simba_gateway=debug …        Verbose logging
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod adb;
mod commands;
mod config;
mod control;
mod diagnostics;
mod displays;
mod gateway;
mod http;
mod pump;
mod session;
mod shell;
mod state;

use crate::adb::DeviceBus;
use crate::config::GatewayConfig;
use crate::state::ServerState;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "simba-gateway", about = "Android screen/audio streaming and control gateway")]
struct Cli {
    /// Static-file HTTP port.
    #[arg(long, env = "HTTP_PORT")]
    http_port: Option<u16>,

    /// WebSocket port.
    #[arg(long = "ws-port", env = "WEBSOCKET_PORT")]
    websocket_port: Option<u16>,

    /// Path to the adb binary.
    #[arg(long = "adb", env = "ADB_PATH")]
    adb_path: Option<PathBuf>,

    /// Local path to the on-device server binary.
    #[arg(long)]
    server_jar: Option<PathBuf>,

    /// Directory served over HTTP.
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("simba_gateway=info,simba_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }
    if let Some(port) = cli.websocket_port {
        config.websocket_port = port;
    }
    if let Some(path) = cli.adb_path {
        config.adb_path = Some(path);
    }
    if let Some(path) = cli.server_jar {
        config.server_jar = path;
    }
    if let Some(path) = cli.static_dir {
        config.static_dir = path;
    }

    info!("simba-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("http port: {}", config.http_port);
    info!("websocket port: {}", config.websocket_port);
    if let Some(url) = &config.server_url {
        info!("upstream server url: {url}");
    }

    // A missing adb degrades the gateway instead of killing it:
    // enumeration reports the condition and `start` fails per-request.
    let bus = match DeviceBus::resolve(config.adb_path.as_deref()).await {
        Ok(bus) => {
            info!("adb: {}", bus.program().display());
            Some(bus)
        }
        Err(e) => {
            warn!("{e}; running degraded");
            None
        }
    };

    let state = ServerState::new(config.clone(), bus);

    // Static files on their own port.
    let http = tokio::spawn(http::run(
        config.http_port,
        config.static_dir.clone(),
        config.dev_mode,
    ));

    // Ctrl-C ends the process; sessions die with it (no cross-restart
    // state by design).
    tokio::select! {
        result = gateway::run(state) => {
            result?;
        }
        result = http => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
