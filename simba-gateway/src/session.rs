//! SessionManager — per-device streaming session lifecycle.
//!
//! Bootstrap: push the server binary, set up the reverse tunnel, bind
//! the local listener *before* spawning the remote process, accept the
//! expected sockets in order (video, audio, control), handshake each,
//! then hand the sockets to their pumps. Teardown reverses every
//! acquisition and is idempotent — the first caller to pull the
//! session record out of the map does the work, later callers no-op.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use simba_core::control as control_msg;
use simba_core::error::GatewayError;
use simba_core::message::ServerEvent;
use simba_core::session::{DisplayMode, ServerOptions, SessionId, StreamSelection};
use simba_core::wire;

use crate::commands::android_major_cached;
use crate::config::{
    HANDSHAKE_TIMEOUT, PUMP_JOIN_TIMEOUT, PUSH_RETRIES, REMOTE_SERVER_PATH, SERVER_PORT_BASE,
    SOCKET_NAME_PREFIX,
};
use crate::control::{run_control_writer, ControlQueue};
use crate::displays;
use crate::pump::{run_audio_pump, run_video_pump, PumpExit};
use crate::state::{ClientSink, DisplayCleanup, SessionEntry, SharedState};

/// The `start` command, decoded.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub command_id: Option<String>,
    pub device_id: String,
    pub video: bool,
    pub audio: bool,
    pub control: bool,
    pub max_fps: Option<u32>,
    pub bitrate: Option<u64>,
    pub display_mode: DisplayMode,
    pub resolution: Option<String>,
    pub dpi: Option<String>,
    pub turn_screen_off: bool,
    pub power_off_on_close: bool,
    pub capture_orientation: Option<String>,
    pub battery_poll_seconds: Option<u64>,
}

/// Why a session is being torn down; controls owner notification and
/// cache invalidation.
#[derive(Debug, Clone)]
pub enum CleanupCause {
    /// Owner requested it or its connection closed. Quiet.
    Detach,
    /// The device ended the stream cleanly. Status only.
    StreamEnded,
    /// A socket failed at runtime. Status plus error.
    Failure(String),
    /// Bootstrap failed; the owner already received the error
    /// response. Quiet, but counts as abnormal.
    BootstrapFailure,
}

impl CleanupCause {
    fn is_abnormal(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::BootstrapFailure)
    }
}

// ── Start ────────────────────────────────────────────────────────

/// Handle the `start` command end to end. Errors surface to the owner
/// as `error{message}` and roll back every acquired resource.
pub async fn start_session(state: SharedState, sink: ClientSink, req: StartRequest) {
    let command_id = req.command_id.clone();
    match bootstrap(&state, &sink, req).await {
        Ok(scid) => {
            info!(%scid, "session running");
        }
        Err((scid, e)) => {
            warn!(error = %e, "session start failed");
            let _ = sink
                .send_event(ServerEvent::Error {
                    message: e.to_string(),
                    command_id,
                })
                .await;
            if let Some(scid) = scid {
                cleanup_session(&state, scid, CleanupCause::BootstrapFailure).await;
            }
        }
    }
}

/// The bootstrap proper. Returns the scid of a session left in the map
/// on failure so the caller can clean it up.
async fn bootstrap(
    state: &SharedState,
    sink: &ClientSink,
    req: StartRequest,
) -> Result<SessionId, (Option<SessionId>, GatewayError)> {
    let pre = |e: GatewayError| (None, e);

    if state.client_session(sink.id()).is_some() {
        return Err(pre(GatewayError::AlreadyAttached));
    }
    let bus = state.bus().map_err(pre)?.clone();
    let device = req.device_id.clone();

    let android_major = android_major_cached(state, &bus, &device)
        .await
        .map_err(pre)?;

    // Audio capture needs Android 11's playback-capture APIs.
    let mut audio = req.audio;
    if audio && android_major < 11 {
        audio = false;
        let _ = sink
            .send_event(ServerEvent::status("Audio disabled (Android < 11)"))
            .await;
    }
    let streams = StreamSelection {
        video: req.video,
        audio,
        control: req.control,
    };
    if streams.socket_count() == 0 {
        return Err(pre(GatewayError::ProtocolViolation(
            "start with no streams selected",
        )));
    }

    // Reserve the session record: scid, owner attachment, teardown
    // tokens. Everything acquired from here on is rolled back through
    // cleanup_session.
    let scid = state.fresh_scid();
    let socket_name = format!("{SOCKET_NAME_PREFIX}{scid}");
    let cancel = CancellationToken::new();
    let control_cancel = CancellationToken::new();
    state
        .insert_session(SessionEntry {
            scid,
            device_id: device.clone(),
            owner: sink.id(),
            phase: simba_core::session::SessionPhase::Provisioning,
            local_port: 0,
            socket_name: socket_name.clone(),
            android_major,
            turn_screen_off: req.turn_screen_off,
            display_cleanup: None,
            control: None,
            cancel: cancel.clone(),
            control_cancel: control_cancel.clone(),
            tasks: Vec::new(),
        })
        .map_err(pre)?;
    let fail = |e: GatewayError| (Some(scid), e);

    // Display-mode preconditions.
    let mut options = ServerOptions::new(scid, streams);
    options.max_fps = req.max_fps;
    options.video_bit_rate = req.bitrate;
    options.capture_orientation = req.capture_orientation.clone();
    options.log_level = Some("info".to_string());
    if req.power_off_on_close {
        options.power_off_on_close = Some(true);
    }

    match req.display_mode {
        DisplayMode::Default => {}
        DisplayMode::Dex => {
            options.display_id = Some(2);
        }
        DisplayMode::Virtual => {
            let resolution = req.resolution.as_deref().unwrap_or("1920x1080");
            let dpi = req.dpi.as_deref().unwrap_or("240");
            options.new_display = Some(format!("{resolution}/{dpi}"));
        }
        DisplayMode::Overlay => {
            let resolution = req
                .resolution
                .as_deref()
                .ok_or_else(|| fail("overlay mode requires resolution".into()))?;
            let dpi = req.dpi.as_deref().unwrap_or("240");
            let display_id = displays::setup_overlay(&bus, &device, resolution, dpi)
                .await
                .map_err(fail)?;
            state.with_session_mut(scid, |e| e.display_cleanup = Some(DisplayCleanup::Overlay));
            options.display_id = Some(display_id);
        }
        DisplayMode::NativeTaskbar => {
            let resolution = req
                .resolution
                .as_deref()
                .ok_or_else(|| fail("native_taskbar mode requires resolution".into()))?;
            displays::setup_native_taskbar(state, &bus, &device, resolution, req.dpi.as_deref())
                .await
                .map_err(fail)?;
            state.with_session_mut(scid, |e| {
                e.display_cleanup = Some(DisplayCleanup::NativeTaskbar)
            });
        }
    }

    // Push the server binary.
    state.advance_phase(scid, |p| p.begin_push());
    bus.push(&device, &state.config.server_jar, REMOTE_SERVER_PATH, PUSH_RETRIES)
        .await
        .map_err(fail)?;

    // Local listener first, then the tunnel onto it, then the remote
    // process — the device connects the moment the server starts.
    let (listener, local_port) = bind_session_listener(state.session_count().saturating_sub(1))
        .await
        .map_err(fail)?;
    state.with_session_mut(scid, |e| e.local_port = local_port);

    let tunnels = bus.reverse_list(&device).await.map_err(fail)?;
    if tunnels.iter().any(|line| line.contains(&socket_name)) {
        // Left over from an abnormal exit; reuse rather than duplicate.
        debug!(%scid, "reverse tunnel already present, reusing");
    } else {
        bus.reverse_add(&device, &socket_name, local_port)
            .await
            .map_err(fail)?;
    }

    // Spawn the device server.
    state.advance_phase(scid, |p| p.begin_spawn());
    let classpath = format!("CLASSPATH={REMOTE_SERVER_PATH}");
    let mut args: Vec<String> = vec![
        classpath,
        "app_process".into(),
        "/".into(),
        "com.genymobile.scrcpy.Server".into(),
        "3.1".into(),
    ];
    args.extend(options.to_args());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut server = bus
        .shell_child(&device, &arg_refs)
        .map_err(|e| fail(GatewayError::ServerSpawnFailed(e.to_string())))?;

    // Watchdog: log server output, kill it when the session dies.
    let server_stdout = server.stdout.take();
    let watchdog = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = server_stdout.map(|out| BufReader::new(out).lines());
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    status = server.wait() => {
                        debug!(?status, "device server exited");
                        break;
                    }
                    line = read_server_line(&mut lines) => {
                        match line {
                            Some(line) => debug!(target: "device_server", "{line}"),
                            None => {
                                // Output closed; keep waiting on exit.
                                lines = None;
                            }
                        }
                    }
                }
            }
            let _ = server.start_kill();
        })
    };
    state.with_session_mut(scid, |e| e.tasks.push(watchdog));

    // Acceptance phase.
    state.advance_phase(scid, |p| p.begin_accept());
    let accepted = accept_sockets(&listener, streams, sink).await.map_err(fail)?;
    drop(listener);

    let AcceptedSockets {
        video: video_socket,
        video_dims,
        audio: audio_socket,
        control: control_socket,
    } = accepted;

    // Transition Running and register the control sink.
    let control_queue = control_socket.as_ref().map(|_| ControlQueue::new());
    state.with_session_mut(scid, |e| {
        e.control = control_queue.clone();
        let _ = e.phase.mark_running();
    });
    let _ = sink
        .send_event(ServerEvent::Status {
            message: "Streaming started".to_string(),
            command_id: req.command_id.clone(),
        })
        .await;

    // Pump wiring: each task reports its exit; the monitor drains the
    // session on the first failure.
    let (exit_tx, exit_rx) = mpsc::channel::<PumpExit>(4);
    let mut tasks = Vec::new();

    if let Some(socket) = video_socket {
        let sink = sink.clone();
        let cancel = cancel.clone();
        let exit_tx = exit_tx.clone();
        let dims = video_dims.unwrap_or((0, 0));
        tasks.push(tokio::spawn(async move {
            let exit = run_video_pump(socket, sink, dims, cancel).await;
            let _ = exit_tx.send(exit).await;
        }));
    }

    if let Some(socket) = audio_socket {
        let sink = sink.clone();
        let cancel = cancel.clone();
        let exit_tx = exit_tx.clone();
        tasks.push(tokio::spawn(async move {
            let exit = run_audio_pump(socket, sink, cancel).await;
            let _ = exit_tx.send(exit).await;
        }));
    }

    if let Some(socket) = control_socket {
        let (read_half, write_half) = socket.into_split();
        let queue = control_queue.clone().expect("queue exists with socket");

        // Writer: single owner of the socket's write side.
        {
            let exit_tx = exit_tx.clone();
            let control_cancel = control_cancel.clone();
            tasks.push(tokio::spawn(async move {
                let exit = match run_control_writer(queue, write_half, control_cancel).await {
                    Ok(()) => PumpExit::Cancelled,
                    Err(e) => PumpExit::Failed(e),
                };
                let _ = exit_tx.send(exit).await;
            }));
        }

        // Reader: the device rarely talks back (clipboard); drain and
        // discard so its writes never block.
        {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut read_half = read_half;
                let mut buf = [0u8; 1024];
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        n = read_half.read(&mut buf) => match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => debug!(bytes = n, "discarded device control message"),
                        }
                    }
                }
            }));
        }

        // Screen-off request rides the control channel once it is up.
        if req.turn_screen_off {
            if let Some(queue) = &control_queue {
                queue.push(control_msg::screen_power_mode_frame(0));
            }
        }
    }

    // Optional battery poll.
    if let Some(seconds) = req.battery_poll_seconds.filter(|&s| s > 0) {
        let state = state.clone();
        let sink = sink.clone();
        let device = device.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(seconds));
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Ok(level) = crate::commands::battery_level(&state, &device).await {
                            if sink.send_event(ServerEvent::BatteryInfo {
                                success: true,
                                level: Some(level),
                                command_id: None,
                            }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    state.with_session_mut(scid, |e| e.tasks.extend(tasks));

    // Monitor: first pump failure or EOF drains the session.
    {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut exit_rx = exit_rx;
            tokio::select! {
                _ = cancel.cancelled() => {}
                exit = exit_rx.recv() => {
                    let cause = match exit {
                        Some(PumpExit::Eof) => Some(CleanupCause::StreamEnded),
                        Some(PumpExit::Failed(e)) => Some(CleanupCause::Failure(e.to_string())),
                        Some(PumpExit::Cancelled) | None => None,
                    };
                    if let Some(cause) = cause {
                        cleanup_session(&state, scid, cause).await;
                    }
                }
            }
        });
    }

    Ok(scid)
}

struct AcceptedSockets {
    video: Option<TcpStream>,
    video_dims: Option<(u32, u32)>,
    audio: Option<TcpStream>,
    control: Option<TcpStream>,
}

/// Accept and handshake the expected sockets in the fixed order:
/// video, audio, control. The first handshaken socket also carries the
/// device name record.
async fn accept_sockets(
    listener: &TcpListener,
    streams: StreamSelection,
    sink: &ClientSink,
) -> Result<AcceptedSockets, GatewayError> {
    let mut accepted = AcceptedSockets {
        video: None,
        video_dims: None,
        audio: None,
        control: None,
    };
    let mut first = true;

    for role in ["video", "audio", "control"] {
        let expected = match role {
            "video" => streams.video,
            "audio" => streams.audio,
            _ => streams.control,
        };
        if !expected {
            continue;
        }

        let (mut socket, peer) = tokio::time::timeout(HANDSHAKE_TIMEOUT, listener.accept())
            .await
            .map_err(|_| GatewayError::HandshakeTimeout(HANDSHAKE_TIMEOUT))?
            .map_err(GatewayError::Io)?;
        let _ = socket.set_nodelay(true);
        debug!(role, %peer, "device socket accepted");

        let handshake = async {
            wire::read_dummy_byte(&mut socket).await?;
            if first {
                let name = wire::read_device_name(&mut socket).await?;
                let _ = sink.send_event(ServerEvent::DeviceName { name }).await;
            }
            match role {
                "video" => {
                    let meta = wire::read_video_meta(&mut socket).await?;
                    let _ = sink
                        .send_event(ServerEvent::VideoInfo {
                            width: meta.width,
                            height: meta.height,
                        })
                        .await;
                    accepted.video_dims = Some((meta.width, meta.height));
                    accepted.video = Some(socket);
                }
                "audio" => match wire::read_audio_codec(&mut socket).await? {
                    Some(codec_id) => {
                        let _ = sink.send_event(ServerEvent::AudioInfo { codec_id }).await;
                        accepted.audio = Some(socket);
                    }
                    None => {
                        // Audio not available on this device; the
                        // socket is closed and the stream disabled.
                        let _ = sink
                            .send_event(ServerEvent::status("Audio not available"))
                            .await;
                        drop(socket);
                    }
                },
                _ => {
                    accepted.control = Some(socket);
                }
            }
            Ok::<(), GatewayError>(())
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| GatewayError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
        first = false;
    }

    Ok(accepted)
}

async fn read_server_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Probe for a free local port starting at the session-derived base.
async fn bind_session_listener(live_sessions: usize) -> Result<(TcpListener, u16), GatewayError> {
    let base = SERVER_PORT_BASE + (live_sessions % 1000) as u16;
    for offset in 0..1000u16 {
        let port = base.saturating_add(offset);
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(GatewayError::Io(e)),
        }
    }
    Err(GatewayError::ReverseSetupFailed(
        "no free local port for session listener".to_string(),
    ))
}

// ── Disconnect ───────────────────────────────────────────────────

/// The `disconnect` command. Idempotent: with no active session the
/// maps are left untouched.
pub async fn disconnect(
    state: &SharedState,
    sink: &ClientSink,
    command_id: Option<String>,
) -> ServerEvent {
    match state.client_session(sink.id()) {
        Some(scid) => {
            cleanup_session(state, scid, CleanupCause::Detach).await;
            ServerEvent::Status {
                message: "Streaming stopped".to_string(),
                command_id,
            }
        }
        None => ServerEvent::Status {
            message: "No active stream to stop".to_string(),
            command_id,
        },
    }
}

// ── Cleanup ──────────────────────────────────────────────────────

/// Tear a session down. Idempotent: only the caller that removes the
/// record from the map proceeds; everyone else returns immediately.
pub async fn cleanup_session(state: &SharedState, scid: SessionId, cause: CleanupCause) {
    let Some(mut entry) = state.remove_session(scid) else {
        return;
    };
    let _ = entry.phase.begin_drain();
    info!(%scid, ?cause, "session draining");

    // Refuse further control enqueues, then close the control socket
    // first — that unblocks the device server's event loop.
    if let Some(queue) = &entry.control {
        queue.close();
    }
    entry.control_cancel.cancel();
    entry.cancel.cancel();

    // Join the session tasks; abandon stragglers after the deadline.
    let joins = futures_util::future::join_all(entry.tasks.drain(..));
    if tokio::time::timeout(PUMP_JOIN_TIMEOUT, joins).await.is_err() {
        warn!(%scid, "session tasks did not join in time; abandoned");
    }

    if let Ok(bus) = state.bus() {
        bus.reverse_remove(&entry.device_id, &entry.socket_name).await;

        match entry.display_cleanup {
            Some(DisplayCleanup::Overlay) => {
                displays::clear_overlay(bus, &entry.device_id).await;
            }
            Some(DisplayCleanup::NativeTaskbar) => {
                displays::cleanup_native_taskbar(state, bus, &entry.device_id).await;
            }
            None => {}
        }

        if entry.turn_screen_off {
            // Wake the display the session turned off.
            if let Err(e) = bus
                .shell_collect(&entry.device_id, &["input", "keyevent", "224"])
                .await
            {
                debug!(device = %entry.device_id, error = %e, "screen wake failed");
            }
        }
    }

    if cause.is_abnormal() {
        state.invalidate_device_facts(&entry.device_id);
    }

    // Notify the owner if it is still connected.
    if let Some(owner) = state.client_sink(entry.owner) {
        match &cause {
            CleanupCause::Detach | CleanupCause::BootstrapFailure => {}
            CleanupCause::StreamEnded => {
                let _ = owner
                    .send_event(ServerEvent::status("Streaming stopped"))
                    .await;
            }
            CleanupCause::Failure(message) => {
                let _ = owner
                    .send_event(ServerEvent::status("Streaming stopped"))
                    .await;
                let _ = owner.send_event(ServerEvent::error(message.clone())).await;
            }
        }
    }

    let _ = entry.phase.close();
    debug!(%scid, "session closed");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::state::{Outbound, ServerState};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn sink_pair(id: u64) -> (ClientSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientSink::new(id, tx, Arc::new(AtomicU64::new(0))), rx)
    }

    fn entry(scid: SessionId, owner: u64) -> SessionEntry {
        SessionEntry {
            scid,
            device_id: "emulator-5554".into(),
            owner,
            phase: simba_core::session::SessionPhase::Running,
            local_port: 27183,
            socket_name: format!("scrcpy_{scid}"),
            android_major: 14,
            turn_screen_off: false,
            display_cleanup: None,
            control: Some(ControlQueue::new()),
            cancel: CancellationToken::new(),
            control_cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_noop() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, _rx) = sink_pair(1);
        state.add_client(sink.clone());

        let event = disconnect(&state, &sink, Some("c1".into())).await;
        match event {
            ServerEvent::Status {
                message,
                command_id,
            } => {
                assert_eq!(message, "No active stream to stop");
                assert_eq!(command_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state.session_count(), 0);
        assert_eq!(state.client_count(), 1);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_single_status() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair(1);
        state.add_client(sink.clone());
        let scid = state.fresh_scid();
        state.insert_session(entry(scid, 1)).unwrap();

        cleanup_session(&state, scid, CleanupCause::StreamEnded).await;
        cleanup_session(&state, scid, CleanupCause::StreamEnded).await;

        assert_eq!(state.session_count(), 0);
        assert_eq!(state.client_session(1), None);

        // Exactly one "Streaming stopped" despite the double cleanup.
        let mut stopped = 0;
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Event(ServerEvent::Status { message, .. }) = out {
                if message == "Streaming stopped" {
                    stopped += 1;
                }
            }
        }
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn runtime_failure_notifies_with_error() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair(1);
        state.add_client(sink.clone());
        let scid = state.fresh_scid();
        state.insert_session(entry(scid, 1)).unwrap();
        state.update_device_facts("emulator-5554", |f| f.android_major = Some(14));

        cleanup_session(
            &state,
            scid,
            CleanupCause::Failure("socket reset".to_string()),
        )
        .await;

        let mut saw_status = false;
        let mut saw_error = false;
        while let Ok(out) = rx.try_recv() {
            match out {
                Outbound::Event(ServerEvent::Status { message, .. }) => {
                    saw_status = message == "Streaming stopped";
                }
                Outbound::Event(ServerEvent::Error { message, .. }) => {
                    saw_error = message.contains("socket reset");
                }
                _ => {}
            }
        }
        assert!(saw_status && saw_error);
        // Abnormal teardown invalidates the device fact cache.
        assert!(state.device_facts("emulator-5554").android_major.is_none());
    }

    #[tokio::test]
    async fn detach_cleanup_is_quiet() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair(1);
        state.add_client(sink.clone());
        let scid = state.fresh_scid();
        state.insert_session(entry(scid, 1)).unwrap();

        cleanup_session(&state, scid, CleanupCause::Detach).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_cancels_session_tasks() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, _rx) = sink_pair(1);
        state.add_client(sink.clone());
        let scid = state.fresh_scid();
        let mut e = entry(scid, 1);
        let cancel = e.cancel.clone();
        let flag = Arc::new(AtomicU64::new(0));
        let task_flag = flag.clone();
        e.tasks.push(tokio::spawn(async move {
            cancel.cancelled().await;
            task_flag.store(1, std::sync::atomic::Ordering::SeqCst);
        }));
        state.insert_session(e).unwrap();

        cleanup_session(&state, scid, CleanupCause::Detach).await;
        assert_eq!(flag.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_probes_past_occupied_port() {
        // Occupy the base port for zero live sessions, then ask for a
        // listener; it must land one port up.
        let (first, first_port) = match bind_session_listener(0).await {
            Ok(pair) => pair,
            Err(_) => return, // base port occupied by the environment
        };
        let (second, second_port) = bind_session_listener(0).await.unwrap();
        assert_ne!(first_port, second_port);
        assert!(second_port > first_port);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn start_without_adb_fails_with_error_event() {
        let state = ServerState::new(GatewayConfig::default(), None);
        let (sink, mut rx) = sink_pair(1);
        state.add_client(sink.clone());

        let req = StartRequest {
            command_id: Some("s1".into()),
            device_id: "emulator-5554".into(),
            video: true,
            audio: true,
            control: true,
            max_fps: Some(30),
            bitrate: Some(4_000_000),
            display_mode: DisplayMode::Default,
            resolution: None,
            dpi: None,
            turn_screen_off: false,
            power_off_on_close: false,
            capture_orientation: None,
            battery_poll_seconds: None,
        };
        start_session(state.clone(), sink.clone(), req).await;

        let mut saw_error = false;
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Event(ServerEvent::Error { command_id, .. }) = out {
                assert_eq!(command_id.as_deref(), Some("s1"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert_eq!(state.session_count(), 0);
    }
}
