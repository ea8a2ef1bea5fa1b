//! Diagnostics capture and HAR tracing.
//!
//! Diagnostics: selected `dumpsys` snapshots written to a log file,
//! followed by a streamed logcat into the same file until stopped.
//! At most one capture per device.
//!
//! HAR: an external collector process (Chrome devtools over an adb
//! forward) whose stdout is streamed to the client as status events.
//! Stopping writes `STOP` on its stdin and escalates to termination
//! after one second. At most one capture per client.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use simba_core::error::GatewayError;
use simba_core::message::ServerEvent;

use crate::state::{ClientSink, DiagnosticsHandle, HarHandle, SharedState};

/// Snapshot sections selectable via `startDiagnostics`.
fn snapshot_command(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "battery" => Some(&["dumpsys", "battery"][..]),
        "memory" => Some(&["dumpsys", "meminfo"][..]),
        "cpu" => Some(&["dumpsys", "cpuinfo"][..]),
        "network" => Some(&["dumpsys", "connectivity"][..]),
        "display" => Some(&["dumpsys", "display"][..]),
        "packages" => Some(&["pm", "list", "packages"][..]),
        _ => None,
    }
}

/// Log file name: `device_diagnostics_<id>_<ts>.log`. Path separators
/// in the device id (tcp endpoints) are flattened.
fn diagnostics_filename(device: &str) -> String {
    let safe_id: String = device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect();
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("device_diagnostics_{safe_id}_{ts}.log")
}

// ── Diagnostics ──────────────────────────────────────────────────

pub async fn start_diagnostics(
    state: &SharedState,
    sink: &ClientSink,
    device: &str,
    kinds: &[String],
    command_id: Option<String>,
) -> ServerEvent {
    let bus = match state.bus() {
        Ok(bus) => bus.clone(),
        Err(e) => {
            return ServerEvent::DiagnosticsResponse {
                success: false,
                message: Some(e.to_string()),
                log_path: None,
                command_id,
            }
        }
    };

    let dir = state.config.diagnostics_dir();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return ServerEvent::DiagnosticsResponse {
            success: false,
            message: Some(format!("cannot create {}: {e}", dir.display())),
            log_path: None,
            command_id,
        };
    }
    let log_path: PathBuf = dir.join(diagnostics_filename(device));
    let log_path_str = log_path.display().to_string();

    let cancel = CancellationToken::new();
    let handle = DiagnosticsHandle {
        owner: sink.id(),
        cancel: cancel.clone(),
        log_path: log_path_str.clone(),
    };
    if !state.try_insert_diagnostics(device, handle) {
        return ServerEvent::DiagnosticsResponse {
            success: false,
            message: Some("diagnostics already running for this device".to_string()),
            log_path: None,
            command_id,
        };
    }

    // Snapshot phase: run each selected section to completion.
    let mut contents = String::new();
    for kind in kinds {
        let Some(args) = snapshot_command(kind) else {
            warn!(device, kind, "unknown diagnostics section skipped");
            continue;
        };
        contents.push_str(&format!("===== {kind} =====\n"));
        match bus.shell_collect(device, args).await {
            Ok(output) => {
                contents.push_str(&output);
                contents.push('\n');
            }
            Err(e) => {
                contents.push_str(&format!("<error: {e}>\n"));
            }
        }
    }

    let mut file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => file,
        Err(e) => {
            state.take_diagnostics(device);
            return ServerEvent::DiagnosticsResponse {
                success: false,
                message: Some(format!("cannot write log file: {e}")),
                log_path: None,
                command_id,
            };
        }
    };
    if let Err(e) = file.write_all(contents.as_bytes()).await {
        state.take_diagnostics(device);
        return ServerEvent::DiagnosticsResponse {
            success: false,
            message: Some(format!("cannot write log file: {e}")),
            log_path: None,
            command_id,
        };
    }

    // Logcat phase: stream into the same file until stopped.
    let mut child = match bus.shell_child(device, &["logcat", "-v", "time"]) {
        Ok(child) => child,
        Err(e) => {
            state.take_diagnostics(device);
            return ServerEvent::DiagnosticsResponse {
                success: false,
                message: Some(format!("logcat spawn failed: {e}")),
                log_path: Some(log_path_str),
                command_id,
            };
        }
    };
    let stdout = child.stdout.take();

    {
        let state = state.clone();
        let sink = sink.clone();
        let device = device.to_string();
        let log_path_str = log_path_str.clone();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    let line = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) => {
                            let mut bytes = line.into_bytes();
                            bytes.push(b'\n');
                            if file.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
            let _ = child.start_kill();
            let _ = file.flush().await;
            // Deregister unless stop_diagnostics already took the handle.
            state.take_diagnostics(&device);
            let _ = sink
                .send_event(ServerEvent::DiagnosticsStopped {
                    device_id: device,
                    log_path: Some(log_path_str),
                })
                .await;
        });
    }

    ServerEvent::DiagnosticsResponse {
        success: true,
        message: Some("diagnostics capture started".to_string()),
        log_path: Some(log_path_str),
        command_id,
    }
}

pub async fn stop_diagnostics(
    state: &SharedState,
    device: &str,
    command_id: Option<String>,
) -> ServerEvent {
    match state.take_diagnostics(device) {
        Some(handle) => {
            handle.cancel.cancel();
            ServerEvent::DiagnosticsResponse {
                success: true,
                message: Some("diagnostics capture stopped".to_string()),
                log_path: Some(handle.log_path),
                command_id,
            }
        }
        None => ServerEvent::DiagnosticsResponse {
            success: false,
            message: Some("no diagnostics running for this device".to_string()),
            log_path: None,
            command_id,
        },
    }
}

// ── HAR tracing ──────────────────────────────────────────────────

pub async fn start_har_trace(
    state: &SharedState,
    sink: &ClientSink,
    device: Option<&str>,
    url: &str,
    har_filename: &str,
    capture_time: u64,
    command_id: Option<String>,
) {
    if state.bus().is_err() {
        let _ = sink
            .send_event(ServerEvent::HarTraceResponse {
                success: false,
                har_filename: None,
                message: Some(GatewayError::AdbUnavailable.to_string()),
                command_id,
            })
            .await;
        return;
    }

    let har_dir = state.config.har_dir();
    if let Err(e) = tokio::fs::create_dir_all(&har_dir).await {
        let _ = sink
            .send_event(ServerEvent::HarTraceResponse {
                success: false,
                har_filename: None,
                message: Some(format!("cannot create {}: {e}", har_dir.display())),
                command_id,
            })
            .await;
        return;
    }

    // Strip any caller-supplied directories; the collector writes
    // under output/har_files itself.
    let filename = std::path::Path::new(har_filename)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "chrome_har_output.har".to_string());

    let mut cmd = tokio::process::Command::new("python3");
    cmd.arg(&state.config.har_script)
        .arg(url)
        .arg(&filename)
        .arg(capture_time.to_string());
    if let Some(device) = device {
        cmd.arg(device);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = sink
                .send_event(ServerEvent::HarTraceResponse {
                    success: false,
                    har_filename: None,
                    message: Some(format!("HAR collector spawn failed: {e}")),
                    command_id,
                })
                .await;
            return;
        }
    };

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let cancel = CancellationToken::new();
    let handle = HarHandle {
        stop_tx,
        cancel: cancel.clone(),
    };
    if !state.set_har(sink.id(), handle) {
        let _ = child.start_kill();
        let _ = sink
            .send_event(ServerEvent::HarTraceResponse {
                success: false,
                har_filename: None,
                message: Some("HAR trace already running".to_string()),
                command_id,
            })
            .await;
        return;
    }

    let stdout = child.stdout.take();
    let mut stdin = child.stdin.take();

    // Status streamer.
    if let Some(stdout) = stdout {
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if sink
                            .send_event(ServerEvent::HarTraceStatus { message: line })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });
    }

    // Supervisor: waits for exit, a stop request, or disconnect.
    {
        let state = state.clone();
        let sink = sink.clone();
        let filename = filename.clone();
        tokio::spawn(async move {
            let success = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        break false;
                    }
                    _ = stop_rx.recv() => {
                        // Graceful stop: "STOP" on stdin, then escalate.
                        if let Some(stdin) = stdin.as_mut() {
                            let _ = stdin.write_all(b"STOP\n").await;
                            let _ = stdin.flush().await;
                        }
                        match tokio::time::timeout(
                            std::time::Duration::from_secs(1),
                            child.wait(),
                        )
                        .await
                        {
                            Ok(status) => break status.map(|s| s.success()).unwrap_or(false),
                            Err(_) => {
                                debug!("HAR collector ignored STOP; terminating");
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                break true;
                            }
                        }
                    }
                    status = child.wait() => {
                        break status.map(|s| s.success()).unwrap_or(false);
                    }
                }
            };
            state.clear_har(sink.id());
            let _ = sink
                .send_event(ServerEvent::HarTraceResponse {
                    success,
                    har_filename: Some(filename),
                    message: None,
                    command_id,
                })
                .await;
        });
    }
}

/// Request a graceful HAR stop for a client.
pub async fn stop_har_trace(state: &SharedState, client: crate::state::ClientId) {
    if let Some(handle) = state.take_har(client) {
        let _ = handle.stop_tx.send(()).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────
