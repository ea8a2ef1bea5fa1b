//! Gateway configuration.
//!
//! The gateway is configured through environment variables (the
//! contract inherited from the legacy launcher) with CLI flags layered
//! on top in `main`. All values have working defaults so a bare
//! `simba-gateway` starts on a developer machine.

use std::path::PathBuf;
use std::time::Duration;

// ── Protocol constants ───────────────────────────────────────────

/// First local port tried for a session's reverse tunnel.
pub const SERVER_PORT_BASE: u16 = 27183;

/// Each expected device socket must finish its handshake within this.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a device command round-trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Pumps get this long to drain after their socket closes before
/// being abandoned.
pub const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client sink backpressure threshold: above this many buffered media
/// bytes, droppable envelopes are discarded.
pub const MAX_CLIENT_BUFFER_BYTES: u64 = 8 * 1024 * 1024;

/// Bounded control queue depth per session.
pub const CONTROL_QUEUE_CAPACITY: usize = 1024;

/// Where the server binary lands on the device.
pub const REMOTE_SERVER_PATH: &str = "/data/local/tmp/simba-server.jar";

/// Device-side abstract socket name prefix; the scid is appended.
pub const SOCKET_NAME_PREFIX: &str = "scrcpy_";

/// Push attempts before `PushFailed`.
pub const PUSH_RETRIES: u32 = 3;

// ── Config ───────────────────────────────────────────────────────

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Static-file HTTP listener port (`HTTP_PORT`).
    pub http_port: u16,
    /// WebSocket listener port (`WEBSOCKET_PORT`).
    pub websocket_port: u16,
    /// Explicit adb binary (`ADB_PATH`); otherwise resolution falls
    /// back to the bundled copy, then to `adb` on PATH.
    pub adb_path: Option<PathBuf>,
    /// Upstream URL advertised to clients (`SIMBA_SERVER_URL`).
    pub server_url: Option<String>,
    /// `NODE_ENV=development` relaxes static-file caching.
    pub dev_mode: bool,
    /// Local copy of the on-device server binary.
    pub server_jar: PathBuf,
    /// HAR collector script spawned for `startHarTrace`.
    pub har_script: PathBuf,
    /// Directory served by the HTTP listener.
    pub static_dir: PathBuf,
    /// Root for diagnostics logs and HAR files.
    pub output_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            websocket_port: 8080,
            adb_path: None,
            server_url: None,
            dev_mode: false,
            server_jar: PathBuf::from("simba-server.jar"),
            har_script: PathBuf::from("har_collection.py"),
            static_dir: PathBuf::from("static"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl GatewayConfig {
    /// Read the documented environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_u16("HTTP_PORT") {
            config.http_port = port;
        }
        if let Some(port) = env_u16("WEBSOCKET_PORT") {
            config.websocket_port = port;
        }
        if let Ok(path) = std::env::var("ADB_PATH") {
            if !path.is_empty() {
                config.adb_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(url) = std::env::var("SIMBA_SERVER_URL") {
            if !url.is_empty() {
                config.server_url = Some(url);
            }
        }
        config.dev_mode = std::env::var("NODE_ENV")
            .map(|v| v == "development")
            .unwrap_or(false);
        config
    }

    /// `output/diagnostics/` under the working directory.
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.output_dir.join("diagnostics")
    }

    /// `output/har_files/` under the working directory.
    pub fn har_dir(&self) -> PathBuf {
        self.output_dir.join("har_files")
    }
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok()?.parse().ok()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.websocket_port, 8080);
        assert!(config.adb_path.is_none());
        assert!(!config.dev_mode);
    }

    #[test]
    fn output_subdirectories() {
        let config = GatewayConfig::default();
        assert!(config.diagnostics_dir().ends_with("output/diagnostics"));
        assert!(config.har_dir().ends_with("output/har_files"));
    }
}
