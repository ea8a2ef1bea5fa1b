//! Client-facing JSON protocol.
//!
//! Text frames from a client are commands tagged by `action`; text
//! frames to a client are events/responses tagged by `type`. Both sides
//! are closed unions: an unknown `action` is rejected as
//! [`ParseFailure::UnknownAction`], never dispatched.
//!
//! Every command may carry a `commandId`; the paired response of type
//! `"<commandType>Response"` echoes it, exactly once.

use serde::{Deserialize, Serialize};

use crate::session::DisplayMode;

// ── Commands (client → server) ───────────────────────────────────

/// All commands understood by the gateway, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    GetAdbDevices {
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Start {
        command_id: Option<String>,
        device_id: String,
        #[serde(default = "default_true")]
        video: bool,
        #[serde(default = "default_true")]
        audio: bool,
        #[serde(default = "default_true")]
        control: bool,
        max_fps: Option<u32>,
        bitrate: Option<u64>,
        #[serde(default)]
        display_mode: DisplayMode,
        /// `<W>x<H>` for overlay / virtual / native_taskbar modes.
        resolution: Option<String>,
        dpi: Option<String>,
        #[serde(default)]
        turn_screen_off: bool,
        #[serde(default)]
        power_off_on_close: bool,
        capture_orientation: Option<String>,
        decoder_type: Option<String>,
        /// Emit `batteryInfo` every N seconds while streaming.
        battery_poll_seconds: Option<u64>,
    },

    #[serde(rename_all = "camelCase")]
    Disconnect {
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Volume {
        command_id: Option<String>,
        device_id: String,
        /// Percentage 0..100, mapped onto the device's max volume.
        value: u8,
    },

    #[serde(rename_all = "camelCase")]
    GetVolume {
        command_id: Option<String>,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    NavAction {
        command_id: Option<String>,
        device_id: String,
        key: String,
    },

    #[serde(rename_all = "camelCase")]
    WifiToggle {
        command_id: Option<String>,
        device_id: String,
        enable: bool,
    },

    #[serde(rename_all = "camelCase")]
    GetWifiStatus {
        command_id: Option<String>,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    GetBatteryLevel {
        command_id: Option<String>,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    LaunchApp {
        command_id: Option<String>,
        device_id: String,
        package_name: String,
    },

    #[serde(rename_all = "camelCase")]
    AdbCommand {
        command_id: Option<String>,
        device_id: String,
        command_type: AdbCommandType,
        /// `<W>x<H>` for setOverlay / setWmSize.
        resolution: Option<String>,
        dpi: Option<String>,
        density: Option<u32>,
        rotation: Option<u32>,
    },

    #[serde(rename_all = "camelCase")]
    StartDiagnostics {
        command_id: Option<String>,
        device_id: String,
        diagnostics: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    StopDiagnostics {
        command_id: Option<String>,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StartHarTrace {
        command_id: Option<String>,
        device_id: Option<String>,
        url: String,
        har_filename: String,
        capture_time: u64,
    },

    #[serde(rename_all = "camelCase")]
    StopHarTrace {
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    StartAdbShell {
        command_id: Option<String>,
        device_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AdbShellInput {
        command_id: Option<String>,
        input: String,
    },

    #[serde(rename_all = "camelCase")]
    StopAdbShell {
        command_id: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

impl ClientCommand {
    /// The correlation id, if the client supplied one.
    pub fn command_id(&self) -> Option<&str> {
        match self {
            ClientCommand::GetAdbDevices { command_id }
            | ClientCommand::Start { command_id, .. }
            | ClientCommand::Disconnect { command_id }
            | ClientCommand::Volume { command_id, .. }
            | ClientCommand::GetVolume { command_id, .. }
            | ClientCommand::NavAction { command_id, .. }
            | ClientCommand::WifiToggle { command_id, .. }
            | ClientCommand::GetWifiStatus { command_id, .. }
            | ClientCommand::GetBatteryLevel { command_id, .. }
            | ClientCommand::LaunchApp { command_id, .. }
            | ClientCommand::AdbCommand { command_id, .. }
            | ClientCommand::StartDiagnostics { command_id, .. }
            | ClientCommand::StopDiagnostics { command_id, .. }
            | ClientCommand::StartHarTrace { command_id, .. }
            | ClientCommand::StopHarTrace { command_id }
            | ClientCommand::StartAdbShell { command_id, .. }
            | ClientCommand::AdbShellInput { command_id, .. }
            | ClientCommand::StopAdbShell { command_id } => command_id.as_deref(),
        }
    }
}

/// Sub-commands of `adbCommand` (display and window-manager surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdbCommandType {
    GetDisplayList,
    SetOverlay,
    SetWmSize,
    SetWmDensity,
    AdbRotateScreen,
    CleanupAdb,
}

// ── Command parsing ──────────────────────────────────────────────

/// Why a client text frame could not become a [`ClientCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// The `action` tag named no known command.
    UnknownAction {
        action: String,
        command_id: Option<String>,
    },
    /// Missing `action`, invalid JSON, or bad field types.
    Malformed {
        detail: String,
        command_id: Option<String>,
    },
}

impl ParseFailure {
    pub fn command_id(&self) -> Option<&str> {
        match self {
            ParseFailure::UnknownAction { command_id, .. }
            | ParseFailure::Malformed { command_id, .. } => command_id.as_deref(),
        }
    }
}

/// Parse a client text frame into a command.
pub fn parse_client_command(text: &str) -> Result<ClientCommand, ParseFailure> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        ParseFailure::Malformed {
            detail: e.to_string(),
            command_id: None,
        }
    })?;

    let command_id = value
        .get("commandId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let action = match value.get("action").and_then(|v| v.as_str()) {
        Some(a) => a.to_string(),
        None => {
            return Err(ParseFailure::Malformed {
                detail: "missing action".to_string(),
                command_id,
            })
        }
    };

    serde_json::from_value::<ClientCommand>(value).map_err(|e| {
        let detail = e.to_string();
        if detail.contains("unknown variant") {
            ParseFailure::UnknownAction { action, command_id }
        } else {
            ParseFailure::Malformed { detail, command_id }
        }
    })
}

// ── Events (server → client) ─────────────────────────────────────

/// A device as reported by `getAdbDevices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub id: String,
    pub state: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// ADB connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Unauthorized,
    Offline,
}

/// One display reported by `getDisplayList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayEntry {
    pub id: u32,
    pub resolution: String,
}

/// Everything the gateway sends to clients as a text frame, tagged by
/// `type`. `adbCommand` responses are enumerated explicitly so the
/// union stays closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    DeviceName { name: String },

    #[serde(rename_all = "camelCase")]
    VideoInfo { width: u32, height: u32 },

    #[serde(rename_all = "camelCase")]
    AudioInfo { codec_id: u32 },

    #[serde(rename_all = "camelCase")]
    ResolutionChange { width: u32, height: u32 },

    #[serde(rename_all = "camelCase")]
    AdbDevicesList {
        success: bool,
        devices: Vec<DeviceEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    VolumeResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    VolumeInfo {
        success: bool,
        /// Current volume as a percentage of the device maximum.
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    NavResponse {
        success: bool,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    WifiResponse {
        success: bool,
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        ssid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    WifiStatus {
        success: bool,
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        ssid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    BatteryInfo {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        level: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    LaunchAppResponse {
        success: bool,
        package_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    GetDisplayListResponse {
        success: bool,
        displays: Vec<DisplayEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SetOverlayResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SetWmSizeResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SetWmDensityResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AdbRotateScreenResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CleanupAdbResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    DiagnosticsResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    DiagnosticsStopped {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_path: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    HarTraceStatus { message: String },

    #[serde(rename_all = "camelCase")]
    HarTraceResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        har_filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    AdbShellOutput { output: String },

    AdbShellClosed,
}

impl ServerEvent {
    /// A bare status event with no correlation id.
    pub fn status(message: impl Into<String>) -> Self {
        ServerEvent::Status {
            message: message.into(),
            command_id: None,
        }
    }

    /// A bare error event with no correlation id.
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            command_id: None,
        }
    }
}

// ── Nav keys ─────────────────────────────────────────────────────

/// Map a navigation key name onto an Android keycode for
/// `input keyevent`. Unknown keys yield `None` and a failure response.
pub fn nav_keycode(key: &str) -> Option<u32> {
    match key {
        "home" => Some(3),
        "back" => Some(4),
        "volumeUp" => Some(24),
        "volumeDown" => Some(25),
        "power" => Some(26),
        "menu" => Some(82),
        "mute" => Some(164),
        "recents" => Some(187),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_with_defaults() {
        let cmd = parse_client_command(
            r#"{"action":"start","deviceId":"emulator-5554","maxFps":30,"bitrate":4000000,"displayMode":"default"}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Start {
                device_id,
                video,
                audio,
                control,
                max_fps,
                bitrate,
                display_mode,
                turn_screen_off,
                ..
            } => {
                assert_eq!(device_id, "emulator-5554");
                assert!(video && audio && control);
                assert_eq!(max_fps, Some(30));
                assert_eq!(bitrate, Some(4_000_000));
                assert_eq!(display_mode, DisplayMode::Default);
                assert!(!turn_screen_off);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_overlay_start() {
        let cmd = parse_client_command(
            r#"{"action":"start","deviceId":"d1","displayMode":"overlay","resolution":"1600x900","dpi":"240"}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Start {
                display_mode,
                resolution,
                dpi,
                ..
            } => {
                assert_eq!(display_mode, DisplayMode::Overlay);
                assert_eq!(resolution.as_deref(), Some("1600x900"));
                assert_eq!(dpi.as_deref(), Some("240"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_rejected() {
        let err = parse_client_command(r#"{"action":"fooBar","commandId":"c1"}"#).unwrap_err();
        match err {
            ParseFailure::UnknownAction { action, command_id } => {
                assert_eq!(action, "fooBar");
                assert_eq!(command_id.as_deref(), Some("c1"));
            }
            other => panic!("expected UnknownAction, got {other:?}"),
        }
    }

    #[test]
    fn missing_action_is_malformed() {
        let err = parse_client_command(r#"{"commandId":"c2"}"#).unwrap_err();
        assert!(matches!(err, ParseFailure::Malformed { .. }));
        assert_eq!(err.command_id(), Some("c2"));
    }

    #[test]
    fn bad_field_type_is_malformed_not_unknown() {
        let err =
            parse_client_command(r#"{"action":"volume","deviceId":"d","value":"loud"}"#)
                .unwrap_err();
        assert!(matches!(err, ParseFailure::Malformed { .. }));
    }

    #[test]
    fn command_id_accessor() {
        let cmd =
            parse_client_command(r#"{"action":"getAdbDevices","commandId":"abc"}"#).unwrap();
        assert_eq!(cmd.command_id(), Some("abc"));

        let cmd = parse_client_command(r#"{"action":"disconnect"}"#).unwrap();
        assert_eq!(cmd.command_id(), None);
    }

    #[test]
    fn adb_command_subtypes() {
        let cmd = parse_client_command(
            r#"{"action":"adbCommand","deviceId":"d","commandType":"getDisplayList"}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::AdbCommand { command_type, .. } => {
                assert_eq!(command_type, AdbCommandType::GetDisplayList);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let err = parse_client_command(
            r#"{"action":"adbCommand","deviceId":"d","commandType":"formatDisk"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseFailure::Malformed { .. }));
    }

    #[test]
    fn event_type_tags() {
        let json = serde_json::to_string(&ServerEvent::status("Streaming started")).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains("Streaming started"));

        let json = serde_json::to_string(&ServerEvent::VideoInfo {
            width: 1080,
            height: 2400,
        })
        .unwrap();
        assert!(json.contains(r#""type":"videoInfo""#));
        assert!(json.contains(r#""width":1080"#));

        let json = serde_json::to_string(&ServerEvent::GetDisplayListResponse {
            success: true,
            displays: vec![DisplayEntry {
                id: 2,
                resolution: "1600x900".into(),
            }],
            command_id: Some("c9".into()),
        })
        .unwrap();
        assert!(json.contains(r#""type":"getDisplayListResponse""#));
        assert!(json.contains(r#""commandId":"c9""#));

        let json = serde_json::to_string(&ServerEvent::AdbShellClosed).unwrap();
        assert_eq!(json, r#"{"type":"adbShellClosed"}"#);
    }

    #[test]
    fn absent_command_id_not_serialized() {
        let json = serde_json::to_string(&ServerEvent::VolumeResponse {
            success: true,
            message: None,
            command_id: None,
        })
        .unwrap();
        assert!(!json.contains("commandId"));
        assert!(!json.contains("message"));
    }

    #[test]
    fn event_roundtrip() {
        let events = vec![
            ServerEvent::DeviceName {
                name: "Pixel".into(),
            },
            ServerEvent::ResolutionChange {
                width: 900,
                height: 1600,
            },
            ServerEvent::AudioInfo {
                codec_id: 0x0061_6163,
            },
            ServerEvent::BatteryInfo {
                success: true,
                level: Some(85),
                command_id: Some("x".into()),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: ServerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn device_state_names() {
        assert_eq!(
            serde_json::to_string(&DeviceState::Unauthorized).unwrap(),
            "\"unauthorized\""
        );
    }

    #[test]
    fn nav_keycodes() {
        assert_eq!(nav_keycode("back"), Some(4));
        assert_eq!(nav_keycode("home"), Some(3));
        assert_eq!(nav_keycode("recents"), Some(187));
        assert_eq!(nav_keycode("power"), Some(26));
        assert_eq!(nav_keycode("teleport"), None);
    }
}
