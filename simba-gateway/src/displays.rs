//! Display modes and the display/window-manager command surface.
//!
//! Overlay and native-taskbar modes mutate global device state before
//! the device server starts; the inverse commands run at session
//! teardown (or `cleanupAdb`). Rotation settings are cached per device
//! so cleanup restores what the user actually had.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use simba_core::error::GatewayError;
use simba_core::message::DisplayEntry;
use simba_core::session::SessionId;

use crate::adb::DeviceBus;
use crate::config::REMOTE_SERVER_PATH;
use crate::state::{RotationState, SharedState};

// ── Display list ─────────────────────────────────────────────────

fn display_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--display-id=(\d+)\s*\(([^)]+)\)").expect("valid regex"))
}

/// Parse the device server's `list_displays` output.
pub fn parse_display_list(output: &str) -> Vec<DisplayEntry> {
    display_line_re()
        .captures_iter(output)
        .filter_map(|caps| {
            Some(DisplayEntry {
                id: caps.get(1)?.as_str().parse().ok()?,
                resolution: caps.get(2)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Run the streaming server in list mode with a fresh scid and parse
/// the advertised displays.
pub async fn list_displays(bus: &DeviceBus, device: &str) -> Result<Vec<DisplayEntry>, GatewayError> {
    let scid = SessionId::random();
    let scid_token = format!("scid={scid}");
    let classpath = format!("CLASSPATH={REMOTE_SERVER_PATH}");
    let output = bus
        .shell_collect(
            device,
            &[
                &classpath,
                "app_process",
                "/",
                "com.genymobile.scrcpy.Server",
                "3.1",
                &scid_token,
                "log_level=info",
                "list_displays=true",
            ],
        )
        .await?;
    Ok(parse_display_list(&output))
}

// ── Overlay mode ─────────────────────────────────────────────────

/// Create an overlay display and discover its id by diffing the
/// display list before and after.
pub async fn setup_overlay(
    bus: &DeviceBus,
    device: &str,
    resolution: &str,
    dpi: &str,
) -> Result<u32, GatewayError> {
    let before = list_displays(bus, device).await?;

    let spec = format!("{resolution}/{dpi}");
    bus.shell_collect(
        device,
        &["settings", "put", "global", "overlay_display_devices", &spec],
    )
    .await?;

    // The new display takes a moment to register.
    for _ in 0..5 {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let after = list_displays(bus, device).await?;
        if let Some(new) = after
            .iter()
            .find(|d| !before.iter().any(|b| b.id == d.id))
        {
            debug!(device, display_id = new.id, "overlay display created");
            return Ok(new.id);
        }
    }

    // Roll back the setting before failing.
    clear_overlay(bus, device).await;
    Err(GatewayError::CommandShellError(
        "overlay display did not appear".to_string(),
    ))
}

/// Remove the overlay display.
pub async fn clear_overlay(bus: &DeviceBus, device: &str) {
    if let Err(e) = bus
        .shell_collect(
            device,
            &["settings", "put", "global", "overlay_display_devices", "null"],
        )
        .await
    {
        warn!(device, error = %e, "failed to clear overlay display");
    }
}

// ── Native taskbar mode ──────────────────────────────────────────

/// The taskbar layout scales DPI from the flipped height: the original
/// rounds before clamping and only ever adjusts downward. Preserved
/// exactly — do not tighten.
pub fn magic_dpi(height: u32) -> u32 {
    (height as f64 / 600.0 * 160.0).round() as u32
}

/// `"1600x900"` → `(1600, 900)`.
pub fn parse_resolution(resolution: &str) -> Option<(u32, u32)> {
    let (w, h) = resolution.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Resize the main display into a landscape taskbar layout: flip W/H,
/// clamp the DPI down to the magic value, and remember the rotation
/// settings for restore.
pub async fn setup_native_taskbar(
    state: &SharedState,
    bus: &DeviceBus,
    device: &str,
    resolution: &str,
    dpi: Option<&str>,
) -> Result<(), GatewayError> {
    let (width, height) = parse_resolution(resolution).ok_or_else(|| {
        GatewayError::CommandShellError(format!("invalid resolution: {resolution}"))
    })?;
    // Landscape: the requested portrait geometry is flipped.
    let (flipped_w, flipped_h) = (height, width);

    let magic = magic_dpi(flipped_h);
    let density = match dpi.and_then(|d| d.trim().parse::<u32>().ok()) {
        Some(requested) => requested.min(magic),
        None => magic,
    };

    save_rotation_snapshot(state, bus, device).await;

    let size = format!("{flipped_w}x{flipped_h}");
    bus.shell_collect(device, &["wm", "size", &size]).await?;
    bus.shell_collect(device, &["wm", "density", &density.to_string()])
        .await?;
    bus.shell_collect(
        device,
        &["settings", "put", "system", "user_rotation", "1"],
    )
    .await?;
    bus.shell_collect(
        device,
        &["settings", "put", "system", "accelerometer_rotation", "0"],
    )
    .await?;
    Ok(())
}

/// Undo `wm size`/`wm density` and restore the cached rotation.
pub async fn cleanup_native_taskbar(state: &SharedState, bus: &DeviceBus, device: &str) {
    for args in [&["wm", "size", "reset"][..], &["wm", "density", "reset"][..]] {
        if let Err(e) = bus.shell_collect(device, args).await {
            warn!(device, error = %e, "wm reset failed");
        }
    }
    restore_rotation(state, bus, device).await;
}

// ── Rotation ─────────────────────────────────────────────────────

/// Capture the current rotation settings into the per-device cache
/// (first capture wins).
pub async fn save_rotation_snapshot(state: &SharedState, bus: &DeviceBus, device: &str) {
    let user_rotation = bus
        .shell_collect(device, &["settings", "get", "system", "user_rotation"])
        .await
        .ok()
        .filter(|v| !v.is_empty() && v != "null");
    let accelerometer_rotation = bus
        .shell_collect(
            device,
            &["settings", "get", "system", "accelerometer_rotation"],
        )
        .await
        .ok()
        .filter(|v| !v.is_empty() && v != "null");
    state.save_rotation(
        device,
        RotationState {
            user_rotation,
            accelerometer_rotation,
        },
    );
}

/// Restore rotation settings from the cache, if a snapshot exists.
pub async fn restore_rotation(state: &SharedState, bus: &DeviceBus, device: &str) {
    let Some(snapshot) = state.take_rotation(device) else {
        return;
    };
    if let Some(value) = snapshot.user_rotation {
        if let Err(e) = bus
            .shell_collect(device, &["settings", "put", "system", "user_rotation", &value])
            .await
        {
            warn!(device, error = %e, "user_rotation restore failed");
        }
    }
    if let Some(value) = snapshot.accelerometer_rotation {
        if let Err(e) = bus
            .shell_collect(
                device,
                &["settings", "put", "system", "accelerometer_rotation", &value],
            )
            .await
        {
            warn!(device, error = %e, "accelerometer_rotation restore failed");
        }
    }
}

/// Rotate the screen to a fixed orientation (0-3), snapshotting the
/// previous settings first so `cleanupAdb` can restore them.
pub async fn rotate_screen(
    state: &SharedState,
    bus: &DeviceBus,
    device: &str,
    rotation: u32,
) -> Result<(), GatewayError> {
    if rotation > 3 {
        return Err(GatewayError::CommandShellError(format!(
            "rotation out of range: {rotation}"
        )));
    }
    save_rotation_snapshot(state, bus, device).await;
    bus.shell_collect(
        device,
        &["settings", "put", "system", "accelerometer_rotation", "0"],
    )
    .await?;
    bus.shell_collect(
        device,
        &[
            "settings",
            "put",
            "system",
            "user_rotation",
            &rotation.to_string(),
        ],
    )
    .await?;
    Ok(())
}

/// The `cleanupAdb` command: restore rotation, clear the overlay, and
/// reset window-manager overrides.
pub async fn cleanup_adb(state: &SharedState, bus: &DeviceBus, device: &str) {
    restore_rotation(state, bus, device).await;
    clear_overlay(bus, device).await;
    for args in [&["wm", "size", "reset"][..], &["wm", "density", "reset"][..]] {
        if let Err(e) = bus.shell_collect(device, args).await {
            warn!(device, error = %e, "wm reset failed during cleanupAdb");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
