//! Interactive ADB shell, streamed to the client as line events.
//!
//! One shell per client. Output lines become `adbShellOutput` events;
//! input is echoed back as `$ <line>` before being written to the
//! shell's stdin, and `stopAdbShell` (or a disconnect) ends the stream
//! with `adbShellClosed`.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use simba_core::message::ServerEvent;

use crate::state::{ClientSink, SharedState, ShellHandle};

/// Open the interactive shell and register it on the client.
pub async fn start_shell(
    state: &SharedState,
    sink: &ClientSink,
    device: Option<&str>,
    command_id: Option<String>,
) {
    let bus = match state.bus() {
        Ok(bus) => bus.clone(),
        Err(e) => {
            let _ = sink
                .send_event(ServerEvent::Error {
                    message: e.to_string(),
                    command_id,
                })
                .await;
            return;
        }
    };

    // One shell per client.
    if state.shell(sink.id()).is_some() {
        let _ = sink
            .send_event(ServerEvent::Error {
                message: "shell already open".to_string(),
                command_id,
            })
            .await;
        return;
    }

    let device = device.unwrap_or_default().to_string();
    let child = if device.is_empty() {
        // No device argument: let adb pick the sole attached device.
        let mut cmd = tokio::process::Command::new(bus.program());
        cmd.arg("shell")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(simba_core::GatewayError::Io)
    } else {
        bus.shell_child(&device, &[])
    };

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            let _ = sink
                .send_event(ServerEvent::Error {
                    message: format!("failed to open shell: {e}"),
                    command_id,
                })
                .await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdin = child.stdin.take();

    let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
    let cancel = CancellationToken::new();
    let handle = ShellHandle {
        input_tx,
        cancel: cancel.clone(),
    };
    if !state.set_shell(sink.id(), handle) {
        debug!(client = sink.id(), "client vanished while opening shell");
        return;
    }

    // stdout reader.
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
                            .send_event(ServerEvent::AdbShellOutput { output: line })
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

    // stderr reader — same event stream, the client renders both.
    if let Some(stderr) = stderr {
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if sink
                            .send_event(ServerEvent::AdbShellOutput { output: line })
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

    // Owner task: feeds stdin, kills the child on cancel.
    {
        let sink = sink.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    input = input_rx.recv() => {
                        let Some(line) = input else { break };
                        if let Some(stdin) = stdin.as_mut() {
                            let mut bytes = line.into_bytes();
                            bytes.push(b'\n');
                            if let Err(e) = stdin.write_all(&bytes).await {
                                warn!(error = %e, "shell stdin write failed");
                                break;
                            }
                        }
                    }
                    status = child.wait() => {
                        debug!(?status, "shell process exited");
                        break;
                    }
                }
            }
            let _ = child.start_kill();
            state.take_shell(sink.id());
            let _ = sink.send_event(ServerEvent::AdbShellClosed).await;
        });
    }

    let _ = sink
        .send_event(ServerEvent::Status {
            message: "Shell started".to_string(),
            command_id,
        })
        .await;
}

/// Echo the input as `$ <line>` and write it to the shell.
pub async fn shell_input(state: &SharedState, sink: &ClientSink, input: &str) {
    let Some(handle) = state.shell(sink.id()) else {
        let _ = sink
            .send_event(ServerEvent::error("no shell open"))
            .await;
        return;
    };
    let _ = sink
        .send_event(ServerEvent::AdbShellOutput {
            output: format!("$ {input}"),
        })
        .await;
    if handle.input_tx.send(input.to_string()).await.is_err() {
        let _ = sink.send_event(ServerEvent::error("shell closed")).await;
    }
}

/// End the shell stream. Idempotent; the owner task emits
/// `adbShellClosed` exactly once when it winds down.
pub async fn stop_shell(state: &SharedState, sink: &ClientSink) {
    match state.shell(sink.id()) {
        Some(handle) => handle.cancel.cancel(),
        None => {
            let _ = sink.send_event(ServerEvent::AdbShellClosed).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::state::{Outbound, ServerState};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn sink_pair() -> (ClientSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientSink::new(1, tx, Arc::new(AtomicU64::new(0))), rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> ServerEvent {
        match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed")
        {
            Outbound::Event(ev) => ev,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_without_shell_reports_error() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair();
        state.add_client(sink.clone());

        shell_input(&state, &sink, "pwd").await;
        let event = next_event(&mut rx).await;
        assert!(matches!(event, ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn stop_without_shell_still_closes() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair();
        state.add_client(sink.clone());

        stop_shell(&state, &sink).await;
        let event = next_event(&mut rx).await;
        assert_eq!(event, ServerEvent::AdbShellClosed);
    }

    #[tokio::test]
    async fn start_without_adb_reports_error() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair();
        state.add_client(sink.clone());

        start_shell(&state, &sink, Some("emulator-5554"), Some("c1".into())).await;
        match next_event(&mut rx).await {
            ServerEvent::Error { command_id, .. } => {
                assert_eq!(command_id.as_deref(), Some("c1"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
