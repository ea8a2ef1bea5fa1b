//! Domain-specific error types for the gateway.
//!
//! All fallible operations return `Result<T, GatewayError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Provisioning Errors ──────────────────────────────────────
    /// No usable `adb` binary was found on this host.
    #[error("adb binary not found (set ADB_PATH or install platform-tools)")]
    AdbUnavailable,

    /// The target device is missing, offline, or unauthorized.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Pushing the on-device server binary failed after bounded retries.
    #[error("failed to push server binary: {0}")]
    PushFailed(String),

    /// Setting up the ADB reverse tunnel failed.
    #[error("reverse tunnel setup failed: {0}")]
    ReverseSetupFailed(String),

    /// The on-device server process could not be spawned.
    #[error("device server spawn failed: {0}")]
    ServerSpawnFailed(String),

    /// A client tried to start a session while already owning one.
    #[error("client already has an active session")]
    AlreadyAttached,

    // ── Handshake Errors ─────────────────────────────────────────
    /// The device sent a non-zero dummy byte during the socket handshake.
    #[error("handshake failed: expected dummy byte 0x00, got {0:#04x}")]
    HandshakeBadDummy(u8),

    /// An expected socket did not complete its handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The device advertised a codec the gateway cannot repackage.
    #[error("unsupported codec id: {0:#010x}")]
    UnsupportedCodec(u32),

    // ── Streaming Errors ─────────────────────────────────────────
    /// A device-side socket was reset or closed mid-stream.
    #[error("socket reset: {0}")]
    SocketReset(String),

    /// Writing to a device-side socket failed.
    #[error("socket write error: {0}")]
    SocketWriteError(String),

    // ── Command Errors ───────────────────────────────────────────
    /// An ADB command did not complete within its deadline.
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// The ADB shell ran but reported a nonzero exit or error output.
    ///
    /// Distinct from transport failure: the device was reachable, the
    /// command itself failed.
    #[error("shell command failed: {0}")]
    CommandShellError(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A client or device message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A session phase transition was not valid from the current phase.
    #[error("invalid session phase transition: {0}")]
    InvalidState(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The owning client connection closed.
    #[error("client connection closed")]
    ConnectionClosed,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for GatewayError {
    fn from(s: String) -> Self {
        GatewayError::Other(s)
    }
}

impl From<&str> for GatewayError {
    fn from(s: &str) -> Self {
        GatewayError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelClosed
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Encoding(e.to_string())
    }
}

impl GatewayError {
    /// Whether this error occurred before any device socket was opened,
    /// meaning no display-mode rollback is needed on cleanup.
    pub fn is_pre_socket(&self) -> bool {
        matches!(
            self,
            GatewayError::AdbUnavailable
                | GatewayError::DeviceUnavailable(_)
                | GatewayError::PushFailed(_)
                | GatewayError::ReverseSetupFailed(_)
                | GatewayError::ServerSpawnFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = GatewayError::HandshakeBadDummy(0x42);
        assert!(e.to_string().contains("0x42"));

        let e = GatewayError::UnsupportedCodec(0x68323635);
        assert!(e.to_string().contains("0x68323635"));
    }

    #[test]
    fn from_string() {
        let e: GatewayError = "something broke".into();
        assert!(matches!(e, GatewayError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: GatewayError = io_err.into();
        assert!(matches!(e, GatewayError::Io(_)));
    }

    #[test]
    fn pre_socket_classification() {
        assert!(GatewayError::PushFailed("x".into()).is_pre_socket());
        assert!(!GatewayError::HandshakeBadDummy(1).is_pre_socket());
        assert!(!GatewayError::SocketReset("x".into()).is_pre_socket());
    }
}
