//! CommandHub — request/response JSON commands.
//!
//! Each command is handled in its own task (the gateway spawns one per
//! inbound message), answers exactly once with its paired
//! `<commandType>Response`, and echoes the client's `commandId`.
//! Device round-trips are bounded by [`COMMAND_TIMEOUT`]; an exceeded
//! deadline yields a failure response, never a hung correlation.

use std::time::Duration;

use tracing::{debug, warn};

use simba_core::error::GatewayError;
use simba_core::message::{nav_keycode, AdbCommandType, ClientCommand, ServerEvent};

use crate::adb::DeviceBus;
use crate::config::COMMAND_TIMEOUT;
use crate::state::{ClientSink, SharedState};
use crate::{diagnostics, displays, session, shell};

// ── Wi-Fi poll cadence ───────────────────────────────────────────

const WIFI_POLL_INTERVAL_MS: u64 = 500;
const WIFI_POLL_INTERVAL: Duration = Duration::from_millis(WIFI_POLL_INTERVAL_MS);
const WIFI_STATE_POLLS: u32 = 10;
const WIFI_SSID_POLLS: u32 = 15;

/// Hard ceiling for the whole `wifiToggle` round-trip: the full
/// polling budget plus head room for the shell commands themselves.
/// Wider than [`COMMAND_TIMEOUT`], which the polling alone exceeds.
const WIFI_TOGGLE_TIMEOUT: Duration = Duration::from_millis(
    WIFI_POLL_INTERVAL_MS * (WIFI_STATE_POLLS as u64 + WIFI_SSID_POLLS as u64) + 10_000,
);

// ── Dispatch ─────────────────────────────────────────────────────

/// Handle one parsed command to completion.
pub async fn handle_command(state: SharedState, sink: ClientSink, cmd: ClientCommand) {
    let command_id = cmd.command_id().map(str::to_string);
    if let Some(id) = &command_id {
        state.track_pending(sink.id(), id, kind_of(&cmd));
    }

    let response = run_command(&state, &sink, cmd).await;

    if let Some(event) = response {
        if sink.send_event(event).await.is_err() {
            debug!(client = sink.id(), "client gone before response");
        }
    }
    if let Some(id) = &command_id {
        state.resolve_pending(sink.id(), id);
    }
}

fn kind_of(cmd: &ClientCommand) -> &'static str {
    match cmd {
        ClientCommand::GetAdbDevices { .. } => "getAdbDevices",
        ClientCommand::Start { .. } => "start",
        ClientCommand::Disconnect { .. } => "disconnect",
        ClientCommand::Volume { .. } => "volume",
        ClientCommand::GetVolume { .. } => "getVolume",
        ClientCommand::NavAction { .. } => "navAction",
        ClientCommand::WifiToggle { .. } => "wifiToggle",
        ClientCommand::GetWifiStatus { .. } => "getWifiStatus",
        ClientCommand::GetBatteryLevel { .. } => "getBatteryLevel",
        ClientCommand::LaunchApp { .. } => "launchApp",
        ClientCommand::AdbCommand { .. } => "adbCommand",
        ClientCommand::StartDiagnostics { .. } => "startDiagnostics",
        ClientCommand::StopDiagnostics { .. } => "stopDiagnostics",
        ClientCommand::StartHarTrace { .. } => "startHarTrace",
        ClientCommand::StopHarTrace { .. } => "stopHarTrace",
        ClientCommand::StartAdbShell { .. } => "startAdbShell",
        ClientCommand::AdbShellInput { .. } => "adbShellInput",
        ClientCommand::StopAdbShell { .. } => "stopAdbShell",
    }
}

/// Run a command; `Some(event)` is the single correlated response,
/// `None` means the handler already answered (streaming commands and
/// the session operations do).
async fn run_command(
    state: &SharedState,
    sink: &ClientSink,
    cmd: ClientCommand,
) -> Option<ServerEvent> {
    match cmd {
        ClientCommand::GetAdbDevices { command_id } => {
            Some(get_adb_devices(state, command_id).await)
        }

        ClientCommand::Start { .. } => {
            session::start_session(state.clone(), sink.clone(), cmd_into_start(cmd)).await;
            None
        }

        ClientCommand::Disconnect { command_id } => {
            Some(session::disconnect(state, sink, command_id).await)
        }

        ClientCommand::Volume {
            command_id,
            device_id,
            value,
        } => Some(set_volume(state, &device_id, value, command_id).await),

        ClientCommand::GetVolume {
            command_id,
            device_id,
        } => Some(get_volume(state, &device_id, command_id).await),

        ClientCommand::NavAction {
            command_id,
            device_id,
            key,
        } => Some(nav_action(state, &device_id, &key, command_id).await),

        ClientCommand::WifiToggle {
            command_id,
            device_id,
            enable,
        } => Some(wifi_toggle(state, &device_id, enable, command_id).await),

        ClientCommand::GetWifiStatus {
            command_id,
            device_id,
        } => Some(get_wifi_status(state, &device_id, command_id).await),

        ClientCommand::GetBatteryLevel {
            command_id,
            device_id,
        } => Some(get_battery_level(state, &device_id, command_id).await),

        ClientCommand::LaunchApp {
            command_id,
            device_id,
            package_name,
        } => Some(launch_app(state, &device_id, &package_name, command_id).await),

        ClientCommand::AdbCommand {
            command_id,
            device_id,
            command_type,
            resolution,
            dpi,
            density,
            rotation,
        } => Some(
            adb_command(
                state,
                &device_id,
                command_type,
                resolution.as_deref(),
                dpi.as_deref(),
                density,
                rotation,
                command_id,
            )
            .await,
        ),

        ClientCommand::StartDiagnostics {
            command_id,
            device_id,
            diagnostics,
        } => Some(
            diagnostics::start_diagnostics(state, sink, &device_id, &diagnostics, command_id)
                .await,
        ),

        ClientCommand::StopDiagnostics {
            command_id,
            device_id,
        } => Some(diagnostics::stop_diagnostics(state, &device_id, command_id).await),

        ClientCommand::StartHarTrace {
            command_id,
            device_id,
            url,
            har_filename,
            capture_time,
        } => {
            diagnostics::start_har_trace(
                state,
                sink,
                device_id.as_deref(),
                &url,
                &har_filename,
                capture_time,
                command_id,
            )
            .await;
            None
        }

        ClientCommand::StopHarTrace { command_id: _ } => {
            diagnostics::stop_har_trace(state, sink.id()).await;
            None
        }

        ClientCommand::StartAdbShell {
            command_id,
            device_id,
        } => {
            shell::start_shell(state, sink, device_id.as_deref(), command_id).await;
            None
        }

        ClientCommand::AdbShellInput {
            command_id: _,
            input,
        } => {
            shell::shell_input(state, sink, &input).await;
            None
        }

        ClientCommand::StopAdbShell { command_id: _ } => {
            shell::stop_shell(state, sink).await;
            None
        }
    }
}

/// Pull the `start` fields into the session module's request type.
fn cmd_into_start(cmd: ClientCommand) -> session::StartRequest {
    match cmd {
        ClientCommand::Start {
            command_id,
            device_id,
            video,
            audio,
            control,
            max_fps,
            bitrate,
            display_mode,
            resolution,
            dpi,
            turn_screen_off,
            power_off_on_close,
            capture_orientation,
            decoder_type: _,
            battery_poll_seconds,
        } => session::StartRequest {
            command_id,
            device_id,
            video,
            audio,
            control,
            max_fps,
            bitrate,
            display_mode,
            resolution,
            dpi,
            turn_screen_off,
            power_off_on_close,
            capture_orientation,
            battery_poll_seconds,
        },
        _ => unreachable!("caller matched Start"),
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Bound a device round-trip by an explicit budget.
async fn with_budget<T>(
    budget: Duration,
    fut: impl std::future::Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::CommandTimeout(budget)),
    }
}

/// Bound a device round-trip by the default command deadline.
async fn with_deadline<T>(
    fut: impl std::future::Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    with_budget(COMMAND_TIMEOUT, fut).await
}

fn failure_message(e: &GatewayError) -> String {
    match e {
        GatewayError::CommandTimeout(_) => "timeout".to_string(),
        other => other.to_string(),
    }
}

/// Android major version, lazily cached per device.
pub async fn android_major_cached(
    state: &SharedState,
    bus: &DeviceBus,
    device: &str,
) -> Result<u8, GatewayError> {
    if let Some(major) = state.device_facts(device).android_major {
        return Ok(major);
    }
    let major = bus.android_major(device).await?;
    state.update_device_facts(device, |f| f.android_major = Some(major));
    Ok(major)
}

/// Max media volume, lazily cached per device.
async fn max_volume_cached(
    state: &SharedState,
    bus: &DeviceBus,
    device: &str,
) -> Result<u8, GatewayError> {
    if let Some(max) = state.device_facts(device).max_volume {
        return Ok(max);
    }
    let output = bus.shell_collect(device, &["dumpsys", "audio"]).await?;
    let (_, max) = parse_music_volume(&output).ok_or_else(|| {
        GatewayError::CommandShellError("could not parse STREAM_MUSIC volume".to_string())
    })?;
    state.update_device_facts(device, |f| f.max_volume = Some(max));
    Ok(max)
}

// ── Device enumeration ───────────────────────────────────────────

async fn get_adb_devices(state: &SharedState, command_id: Option<String>) -> ServerEvent {
    let bus = match state.bus() {
        Ok(bus) => bus,
        Err(e) => {
            // Degraded mode: report the condition instead of a list.
            return ServerEvent::AdbDevicesList {
                success: false,
                devices: Vec::new(),
                message: Some(e.to_string()),
                command_id,
            };
        }
    };
    match with_deadline(bus.list()).await {
        Ok(devices) => ServerEvent::AdbDevicesList {
            success: true,
            devices,
            message: None,
            command_id,
        },
        Err(e) => ServerEvent::AdbDevicesList {
            success: false,
            devices: Vec::new(),
            message: Some(failure_message(&e)),
            command_id,
        },
    }
}

// ── Volume ───────────────────────────────────────────────────────

async fn set_volume(
    state: &SharedState,
    device: &str,
    value: u8,
    command_id: Option<String>,
) -> ServerEvent {
    let result = with_deadline(async {
        let bus = state.bus()?;
        let percent = value.min(100) as u32;
        let max = max_volume_cached(state, bus, device).await? as u32;
        // 0 → 0 and 100 → max, exactly.
        let target = (percent * max + 50) / 100;
        let target = target.to_string();

        let major = android_major_cached(state, bus, device).await?;
        if major <= 10 {
            bus.shell_collect(device, &["media", "volume", "--stream", "3", "--set", &target])
                .await?;
        } else {
            bus.shell_collect(
                device,
                &["cmd", "media_session", "volume", "--stream", "3", "--set", &target],
            )
            .await?;
        }
        Ok(())
    })
    .await;

    match result {
        Ok(()) => ServerEvent::VolumeResponse {
            success: true,
            message: None,
            command_id,
        },
        Err(e) => ServerEvent::VolumeResponse {
            success: false,
            message: Some(failure_message(&e)),
            command_id,
        },
    }
}

async fn get_volume(
    state: &SharedState,
    device: &str,
    command_id: Option<String>,
) -> ServerEvent {
    let result = with_deadline(async {
        let bus = state.bus()?;
        let output = bus.shell_collect(device, &["dumpsys", "audio"]).await?;
        let (current, max) = parse_music_volume(&output).ok_or_else(|| {
            GatewayError::CommandShellError("could not parse STREAM_MUSIC volume".to_string())
        })?;
        state.update_device_facts(device, |f| f.max_volume = Some(max));
        Ok(volume_percent(current, max))
    })
    .await;

    match result {
        Ok(percent) => ServerEvent::VolumeInfo {
            success: true,
            volume: Some(percent),
            command_id,
        },
        Err(e) => {
            warn!(device, error = %e, "getVolume failed");
            ServerEvent::VolumeInfo {
                success: false,
                volume: None,
                command_id,
            }
        }
    }
}

// ── Navigation ───────────────────────────────────────────────────

async fn nav_action(
    state: &SharedState,
    device: &str,
    key: &str,
    command_id: Option<String>,
) -> ServerEvent {
    let Some(keycode) = nav_keycode(key) else {
        return ServerEvent::NavResponse {
            success: false,
            key: key.to_string(),
            message: Some(format!("unknown nav key: {key}")),
            command_id,
        };
    };
    let result = with_deadline(async {
        state
            .bus()?
            .shell_collect(device, &["input", "keyevent", &keycode.to_string()])
            .await
    })
    .await;

    match result {
        Ok(_) => ServerEvent::NavResponse {
            success: true,
            key: key.to_string(),
            message: None,
            command_id,
        },
        Err(e) => ServerEvent::NavResponse {
            success: false,
            key: key.to_string(),
            message: Some(failure_message(&e)),
            command_id,
        },
    }
}

// ── Wi-Fi ────────────────────────────────────────────────────────

async fn wifi_toggle(
    state: &SharedState,
    device: &str,
    enable: bool,
    command_id: Option<String>,
) -> ServerEvent {
    // The poll loops bound the attempt count, the outer budget bounds
    // wall time — a single hung adb call must not outlive the command.
    let result: Result<Option<String>, GatewayError> = with_budget(WIFI_TOGGLE_TIMEOUT, async {
        let bus = state.bus()?;
        let verb = if enable { "enable" } else { "disable" };
        bus.shell_collect(device, &["svc", "wifi", verb]).await?;

        // Confirm the radio state flipped.
        let mut confirmed = false;
        for _ in 0..WIFI_STATE_POLLS {
            tokio::time::sleep(WIFI_POLL_INTERVAL).await;
            let output = bus.shell_collect(device, &["dumpsys", "wifi"]).await?;
            if parse_wifi_enabled(&output) == Some(enable) {
                confirmed = true;
                break;
            }
        }
        if !confirmed {
            return Err(GatewayError::CommandTimeout(
                WIFI_POLL_INTERVAL * WIFI_STATE_POLLS,
            ));
        }
        if !enable {
            return Ok(None);
        }

        // Enabled: wait for an SSID to resolve.
        for _ in 0..WIFI_SSID_POLLS {
            let output = bus.shell_collect(device, &["dumpsys", "wifi"]).await?;
            if let Some(ssid) = parse_wifi_ssid(&output) {
                return Ok(Some(ssid));
            }
            tokio::time::sleep(WIFI_POLL_INTERVAL).await;
        }
        Ok(None)
    })
    .await;

    match result {
        Ok(ssid) => ServerEvent::WifiResponse {
            success: true,
            enabled: enable,
            ssid,
            message: None,
            command_id,
        },
        Err(e) => ServerEvent::WifiResponse {
            success: false,
            enabled: !enable,
            ssid: None,
            message: Some(failure_message(&e)),
            command_id,
        },
    }
}

async fn get_wifi_status(
    state: &SharedState,
    device: &str,
    command_id: Option<String>,
) -> ServerEvent {
    let result = with_deadline(async {
        let output = state
            .bus()?
            .shell_collect(device, &["dumpsys", "wifi"])
            .await?;
        let enabled = parse_wifi_enabled(&output).unwrap_or(false);
        let ssid = if enabled { parse_wifi_ssid(&output) } else { None };
        Ok((enabled, ssid))
    })
    .await;

    match result {
        Ok((enabled, ssid)) => ServerEvent::WifiStatus {
            success: true,
            enabled,
            ssid,
            command_id,
        },
        Err(e) => {
            warn!(device, error = %e, "getWifiStatus failed");
            ServerEvent::WifiStatus {
                success: false,
                enabled: false,
                ssid: None,
                command_id,
            }
        }
    }
}

// ── Battery ──────────────────────────────────────────────────────

async fn get_battery_level(
    state: &SharedState,
    device: &str,
    command_id: Option<String>,
) -> ServerEvent {
    match battery_level(state, device).await {
        Ok(level) => ServerEvent::BatteryInfo {
            success: true,
            level: Some(level),
            command_id,
        },
        Err(e) => {
            warn!(device, error = %e, "getBatteryLevel failed");
            ServerEvent::BatteryInfo {
                success: false,
                level: None,
                command_id,
            }
        }
    }
}

/// One battery read; also used by the per-session battery poll.
pub async fn battery_level(state: &SharedState, device: &str) -> Result<u8, GatewayError> {
    with_deadline(async {
        let output = state
            .bus()?
            .shell_collect(device, &["dumpsys", "battery"])
            .await?;
        parse_battery_level(&output).ok_or_else(|| {
            GatewayError::CommandShellError("could not parse battery level".to_string())
        })
    })
    .await
}

// ── App launch ───────────────────────────────────────────────────

async fn launch_app(
    state: &SharedState,
    device: &str,
    package: &str,
    command_id: Option<String>,
) -> ServerEvent {
    let result = with_deadline(async {
        state
            .bus()?
            .shell_collect(
                device,
                &["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"],
            )
            .await
    })
    .await;

    match result {
        Ok(_) => ServerEvent::LaunchAppResponse {
            success: true,
            package_name: package.to_string(),
            message: None,
            command_id,
        },
        Err(e) => ServerEvent::LaunchAppResponse {
            success: false,
            package_name: package.to_string(),
            message: Some(failure_message(&e)),
            command_id,
        },
    }
}

// ── Display / WM surface ─────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn adb_command(
    state: &SharedState,
    device: &str,
    command_type: AdbCommandType,
    resolution: Option<&str>,
    dpi: Option<&str>,
    density: Option<u32>,
    rotation: Option<u32>,
    command_id: Option<String>,
) -> ServerEvent {
    let bus = match state.bus() {
        Ok(bus) => bus.clone(),
        Err(e) => return adb_command_failure(command_type, &e, command_id),
    };

    match command_type {
        AdbCommandType::GetDisplayList => {
            match with_deadline(displays::list_displays(&bus, device)).await {
                Ok(displays) => ServerEvent::GetDisplayListResponse {
                    success: true,
                    displays,
                    command_id,
                },
                Err(e) => {
                    warn!(device, error = %e, "getDisplayList failed");
                    ServerEvent::GetDisplayListResponse {
                        success: false,
                        displays: Vec::new(),
                        command_id,
                    }
                }
            }
        }

        AdbCommandType::SetOverlay => {
            let result = match (resolution, dpi) {
                (Some(res), Some(dpi)) => {
                    displays::setup_overlay(&bus, device, res, dpi).await.map(|_| ())
                }
                _ => Err(GatewayError::CommandShellError(
                    "setOverlay requires resolution and dpi".to_string(),
                )),
            };
            finish_adb_command(command_type, result, command_id)
        }

        AdbCommandType::SetWmSize => {
            let result = match resolution {
                Some(res) if displays::parse_resolution(res).is_some() => {
                    with_deadline(async {
                        bus.shell_collect(device, &["wm", "size", res]).await?;
                        Ok(())
                    })
                    .await
                }
                _ => Err(GatewayError::CommandShellError(
                    "setWmSize requires a WxH resolution".to_string(),
                )),
            };
            finish_adb_command(command_type, result, command_id)
        }

        AdbCommandType::SetWmDensity => {
            let result = match density {
                Some(value) => {
                    with_deadline(async {
                        bus.shell_collect(device, &["wm", "density", &value.to_string()])
                            .await?;
                        Ok(())
                    })
                    .await
                }
                None => Err(GatewayError::CommandShellError(
                    "setWmDensity requires density".to_string(),
                )),
            };
            finish_adb_command(command_type, result, command_id)
        }

        AdbCommandType::AdbRotateScreen => {
            let result = match rotation {
                Some(value) => {
                    with_deadline(displays::rotate_screen(state, &bus, device, value)).await
                }
                None => Err(GatewayError::CommandShellError(
                    "adbRotateScreen requires rotation".to_string(),
                )),
            };
            finish_adb_command(command_type, result, command_id)
        }

        AdbCommandType::CleanupAdb => {
            displays::cleanup_adb(state, &bus, device).await;
            finish_adb_command(command_type, Ok(()), command_id)
        }
    }
}

fn finish_adb_command(
    command_type: AdbCommandType,
    result: Result<(), GatewayError>,
    command_id: Option<String>,
) -> ServerEvent {
    let (success, message) = match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(failure_message(&e))),
    };
    build_adb_response(command_type, success, message, command_id)
}

fn adb_command_failure(
    command_type: AdbCommandType,
    error: &GatewayError,
    command_id: Option<String>,
) -> ServerEvent {
    build_adb_response(command_type, false, Some(error.to_string()), command_id)
}

fn build_adb_response(
    command_type: AdbCommandType,
    success: bool,
    message: Option<String>,
    command_id: Option<String>,
) -> ServerEvent {
    match command_type {
        AdbCommandType::GetDisplayList => ServerEvent::GetDisplayListResponse {
            success,
            displays: Vec::new(),
            command_id,
        },
        AdbCommandType::SetOverlay => ServerEvent::SetOverlayResponse {
            success,
            message,
            command_id,
        },
        AdbCommandType::SetWmSize => ServerEvent::SetWmSizeResponse {
            success,
            message,
            command_id,
        },
        AdbCommandType::SetWmDensity => ServerEvent::SetWmDensityResponse {
            success,
            message,
            command_id,
        },
        AdbCommandType::AdbRotateScreen => ServerEvent::AdbRotateScreenResponse {
            success,
            message,
            command_id,
        },
        AdbCommandType::CleanupAdb => ServerEvent::CleanupAdbResponse {
            success,
            message,
            command_id,
        },
    }
}

// ── Parsers ──────────────────────────────────────────────────────

/// `dumpsys battery` → level, range-checked to 0..=100.
pub fn parse_battery_level(output: &str) -> Option<u8> {
    let level: i32 = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("level:"))?
        .trim()
        .parse()
        .ok()?;
    (0..=100).contains(&level).then_some(level as u8)
}

/// `dumpsys audio` STREAM_MUSIC block → `(current, max)`.
pub fn parse_music_volume(output: &str) -> Option<(u8, u8)> {
    let start = output.find("- STREAM_MUSIC")?;
    let block = &output[start..];
    // Stop at the next stream header, if any.
    let end = block[1..].find("- STREAM_").map(|i| i + 1).unwrap_or(block.len());
    let block = &block[..end];

    let max = find_labeled_number(block, "Max:")?;
    // Newer dumps list per-route values; "(default)" is the one to use.
    let current = block
        .find("(default):")
        .and_then(|i| first_number(&block[i + "(default):".len()..]))
        .or_else(|| find_labeled_number(block, "Current:"))?;
    Some((current, max))
}

fn find_labeled_number(block: &str, label: &str) -> Option<u8> {
    let i = block.find(label)?;
    first_number(&block[i + label.len()..])
}

fn first_number(s: &str) -> Option<u8> {
    let s = s.trim_start();
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// `dumpsys wifi` → whether the radio is enabled.
pub fn parse_wifi_enabled(output: &str) -> Option<bool> {
    if output.contains("Wi-Fi is enabled") {
        Some(true)
    } else if output.contains("Wi-Fi is disabled") {
        Some(false)
    } else {
        None
    }
}

/// `dumpsys wifi` → connected SSID, if associated.
pub fn parse_wifi_ssid(output: &str) -> Option<String> {
    for line in output.lines() {
        if !line.contains("mWifiInfo") && !line.contains("current SSID") {
            continue;
        }
        if let Some(i) = line.find("SSID:") {
            let rest = line[i + 5..].trim_start();
            let ssid = if let Some(stripped) = rest.strip_prefix('"') {
                stripped.split('"').next().unwrap_or("")
            } else {
                rest.split([',', ' ']).next().unwrap_or("")
            };
            if !ssid.is_empty() && ssid != "<unknown" && !ssid.starts_with("<unknown") {
                return Some(ssid.to_string());
            }
        }
    }
    None
}

/// Convert a device volume step to a percentage. `0 → 0`, `max → 100`.
pub fn volume_percent(current: u8, max: u8) -> u8 {
    if max == 0 {
        return 0;
    }
    (((current as u32) * 100 + (max as u32) / 2) / max as u32).min(100) as u8
}

// ── Tests ────────────────────────────────────────────────────────
