//! Session identity, lifecycle phases, and device-server options.
//!
//! The phase machine models the full streaming-session lifecycle with
//! validated transitions that return `Result` instead of panicking:
//!
//! ```text
//! Provisioning ─► Pushing ─► ServerSpawning ─► AwaitingSockets ─► Running
//!       │            │             │                 │               │
//!       └────────────┴─────────────┴────────┬────────┴───────────────┘
//!                                           ▼
//!                                       Draining ─► Closed
//! ```
//!
//! There is no stored `Failed` state: a failure in any phase drains
//! immediately, so `begin_drain` is valid from every non-terminal phase.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

// ── SessionId ────────────────────────────────────────────────────

/// Session correlation id: 31-bit random value, rendered as 8
/// lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// Draw a fresh random id. Uniqueness among live sessions is
    /// enforced by the session map, not here.
    pub fn random() -> Self {
        Self(rand::random::<u32>() & 0x7FFF_FFFF)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw & 0x7FFF_FFFF)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = u32::from_str_radix(s, 16)
            .map_err(|_| GatewayError::ProtocolViolation("invalid session id"))?;
        if raw & 0x8000_0000 != 0 {
            return Err(GatewayError::ProtocolViolation("session id exceeds 31 bits"));
        }
        Ok(Self(raw))
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle phase of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Session record created; nothing touched the device yet.
    #[default]
    Provisioning,
    /// Server binary being pushed to the device.
    Pushing,
    /// Reverse tunnel up, `app_process` being spawned.
    ServerSpawning,
    /// Listening for the device's socket connections.
    AwaitingSockets,
    /// All expected sockets handshaked; pumps running.
    Running,
    /// Teardown in progress; pumps refuse further enqueues.
    Draining,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "Provisioning",
            Self::Pushing => "Pushing",
            Self::ServerSpawning => "ServerSpawning",
            Self::AwaitingSockets => "AwaitingSockets",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}

impl SessionPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether media/control traffic may still be enqueued.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, Self::Running)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Provisioning`.
    pub fn begin_push(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Provisioning => {
                *self = Self::Pushing;
                Ok(())
            }
            _ => Err(GatewayError::InvalidState(
                "cannot push: not in Provisioning",
            )),
        }
    }

    /// Valid from: `Pushing`.
    pub fn begin_spawn(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Pushing => {
                *self = Self::ServerSpawning;
                Ok(())
            }
            _ => Err(GatewayError::InvalidState("cannot spawn: not in Pushing")),
        }
    }

    /// Valid from: `ServerSpawning`.
    pub fn begin_accept(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::ServerSpawning => {
                *self = Self::AwaitingSockets;
                Ok(())
            }
            _ => Err(GatewayError::InvalidState(
                "cannot accept: not in ServerSpawning",
            )),
        }
    }

    /// Valid from: `AwaitingSockets`.
    pub fn mark_running(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::AwaitingSockets => {
                *self = Self::Running;
                Ok(())
            }
            _ => Err(GatewayError::InvalidState(
                "cannot run: not in AwaitingSockets",
            )),
        }
    }

    /// Valid from: every phase except `Closed`. Draining twice is a
    /// no-op so that cleanup stays idempotent.
    pub fn begin_drain(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Closed => Err(GatewayError::InvalidState("cannot drain: already closed")),
            _ => {
                *self = Self::Draining;
                Ok(())
            }
        }
    }

    /// Valid from: `Draining`.
    pub fn close(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Draining => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(GatewayError::InvalidState("cannot close: not in Draining")),
        }
    }
}

// ── Display modes ────────────────────────────────────────────────

/// How the on-device server captures its display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Mirror the main display.
    #[default]
    Default,
    /// Capture a secondary display created with
    /// `overlay_display_devices`.
    Overlay,
    /// Let the server create its own virtual display.
    Virtual,
    /// Samsung DeX secondary display (fixed display id 2).
    Dex,
    /// Resize the main display into a landscape taskbar layout.
    NativeTaskbar,
}

impl DisplayMode {
    /// Modes whose preconditions mutate global device state and need
    /// inverse commands at teardown.
    pub fn needs_cleanup(&self) -> bool {
        matches!(self, Self::Overlay | Self::NativeTaskbar)
    }
}

// ── Stream selection ─────────────────────────────────────────────

/// Which of the three device sockets a session expects, in acceptance
/// order: video, audio, control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    pub video: bool,
    pub audio: bool,
    pub control: bool,
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            control: true,
        }
    }
}

impl StreamSelection {
    /// Number of sockets the device will open.
    pub fn socket_count(&self) -> usize {
        [self.video, self.audio, self.control]
            .iter()
            .filter(|&&b| b)
            .count()
    }
}

// ── Server options ───────────────────────────────────────────────

/// Options serialized onto the on-device server command line as
/// space-separated `key=value` tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub scid: SessionId,
    pub video: bool,
    pub audio: bool,
    pub control: bool,
    pub max_fps: Option<u32>,
    pub video_bit_rate: Option<u64>,
    pub power_on: Option<bool>,
    pub power_off_on_close: Option<bool>,
    pub display_id: Option<u32>,
    /// `<WxH>/<DPI>` for a server-created virtual display.
    pub new_display: Option<String>,
    pub capture_orientation: Option<String>,
    pub log_level: Option<String>,
}

impl ServerOptions {
    pub fn new(scid: SessionId, streams: StreamSelection) -> Self {
        Self {
            scid,
            video: streams.video,
            audio: streams.audio,
            control: streams.control,
            max_fps: None,
            video_bit_rate: None,
            power_on: None,
            power_off_on_close: None,
            display_id: None,
            new_display: None,
            capture_orientation: None,
            log_level: None,
        }
    }

    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.max_fps = Some(fps);
        self
    }

    pub fn with_bit_rate(mut self, bps: u64) -> Self {
        self.video_bit_rate = Some(bps);
        self
    }

    pub fn with_display_id(mut self, id: u32) -> Self {
        self.display_id = Some(id);
        self
    }

    pub fn with_new_display(mut self, spec: impl Into<String>) -> Self {
        self.new_display = Some(spec.into());
        self
    }

    /// Serialize in the fixed token order the device server expects.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("scid={}", self.scid),
            format!("video={}", self.video),
            format!("audio={}", self.audio),
            format!("control={}", self.control),
        ];
        if let Some(level) = &self.log_level {
            args.push(format!("log_level={level}"));
        }
        if let Some(fps) = self.max_fps {
            args.push(format!("max_fps={fps}"));
        }
        if let Some(bps) = self.video_bit_rate {
            args.push(format!("video_bit_rate={bps}"));
        }
        if let Some(on) = self.power_on {
            args.push(format!("power_on={on}"));
        }
        if let Some(off) = self.power_off_on_close {
            args.push(format!("power_off_on_close={off}"));
        }
        if let Some(id) = self.display_id {
            args.push(format!("display_id={id}"));
        }
        if let Some(spec) = &self.new_display {
            args.push(format!("new_display={spec}"));
        }
        if let Some(orientation) = &self.capture_orientation {
            args.push(format!("capture_orientation={orientation}"));
        }
        args
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_format_and_parse() {
        let id = SessionId::from_raw(0x1234_ABCD);
        assert_eq!(id.to_string(), "1234abcd");
        let parsed: SessionId = "1234abcd".parse().unwrap();
        assert_eq!(parsed, id);

        let small = SessionId::from_raw(0x2A);
        assert_eq!(small.to_string(), "0000002a");
    }

    #[test]
    fn session_id_is_31_bit() {
        for _ in 0..64 {
            assert_eq!(SessionId::random().raw() & 0x8000_0000, 0);
        }
        assert!("ffffffff".parse::<SessionId>().is_err());
        assert!("zzzz".parse::<SessionId>().is_err());
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::default();
        phase.begin_push().unwrap();
        phase.begin_spawn().unwrap();
        phase.begin_accept().unwrap();
        phase.mark_running().unwrap();
        assert!(phase.is_running());
        assert!(phase.accepts_traffic());

        phase.begin_drain().unwrap();
        assert!(!phase.accepts_traffic());
        phase.close().unwrap();
        assert!(phase.is_terminal());
    }

    #[test]
    fn drain_from_any_phase() {
        for mut phase in [
            SessionPhase::Provisioning,
            SessionPhase::Pushing,
            SessionPhase::ServerSpawning,
            SessionPhase::AwaitingSockets,
            SessionPhase::Running,
            SessionPhase::Draining,
        ] {
            phase.begin_drain().unwrap();
            assert_eq!(phase, SessionPhase::Draining);
        }
    }

    #[test]
    fn drain_is_idempotent_but_closed_is_terminal() {
        let mut phase = SessionPhase::Draining;
        phase.begin_drain().unwrap();
        phase.close().unwrap();
        assert!(phase.begin_drain().is_err());
        assert!(phase.close().is_err());
    }

    #[test]
    fn invalid_transitions() {
        let mut phase = SessionPhase::Provisioning;
        assert!(phase.mark_running().is_err());
        assert!(phase.begin_accept().is_err());
        assert!(phase.close().is_err());
    }

    #[test]
    fn stream_selection_count() {
        assert_eq!(StreamSelection::default().socket_count(), 3);
        let video_only = StreamSelection {
            video: true,
            audio: false,
            control: false,
        };
        assert_eq!(video_only.socket_count(), 1);
    }

    #[test]
    fn server_options_tokens() {
        let scid = SessionId::from_raw(0xBEEF);
        let opts = ServerOptions::new(scid, StreamSelection::default())
            .with_max_fps(30)
            .with_bit_rate(4_000_000);
        let args = opts.to_args();
        assert_eq!(args[0], "scid=0000beef");
        assert!(args.contains(&"video=true".to_string()));
        assert!(args.contains(&"audio=true".to_string()));
        assert!(args.contains(&"control=true".to_string()));
        assert!(args.contains(&"max_fps=30".to_string()));
        assert!(args.contains(&"video_bit_rate=4000000".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("display_id=")));
    }

    #[test]
    fn server_options_display_tokens() {
        let scid = SessionId::from_raw(1);
        let opts = ServerOptions::new(scid, StreamSelection::default())
            .with_new_display("1600x900/240");
        assert!(opts
            .to_args()
            .contains(&"new_display=1600x900/240".to_string()));

        let opts = ServerOptions::new(scid, StreamSelection::default()).with_display_id(2);
        assert!(opts.to_args().contains(&"display_id=2".to_string()));
    }

    #[test]
    fn display_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&DisplayMode::NativeTaskbar).unwrap(),
            "\"native_taskbar\""
        );
        let parsed: DisplayMode = serde_json::from_str("\"overlay\"").unwrap();
        assert_eq!(parsed, DisplayMode::Overlay);
    }

    #[test]
    fn cleanup_modes() {
        assert!(DisplayMode::Overlay.needs_cleanup());
        assert!(DisplayMode::NativeTaskbar.needs_cleanup());
        assert!(!DisplayMode::Default.needs_cleanup());
        assert!(!DisplayMode::Virtual.needs_cleanup());
        assert!(!DisplayMode::Dex.needs_cleanup());
    }
}
