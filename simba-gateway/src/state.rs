//! Shared server state.
//!
//! The legacy implementation kept `sessions`, `wsClients`,
//! `diagnosticsProcesses`, `activeShells` and friends as module-level
//! mutable maps. Here they are consolidated into one [`ServerState`]
//! value passed explicitly, with a single lock over the client/session
//! maps. Locks are held only across map mutations, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use simba_core::error::GatewayError;
use simba_core::message::ServerEvent;
use simba_core::session::{SessionId, SessionPhase};

use crate::adb::DeviceBus;
use crate::config::{GatewayConfig, MAX_CLIENT_BUFFER_BYTES};
use crate::control::ControlQueue;

pub type ClientId = u64;

// ── Outbound traffic ─────────────────────────────────────────────

/// A frame queued for a client's WebSocket writer.
#[derive(Debug)]
pub enum Outbound {
    /// JSON text frame.
    Event(ServerEvent),
    /// Pre-encoded binary envelope.
    Media(Vec<u8>),
}

/// Cheap-to-clone sender half of a client connection.
///
/// Media bytes are counted into a shared gauge when enqueued; the
/// writer task subtracts them once they reach the socket. Pumps read
/// the gauge to decide when to shed droppable envelopes.
#[derive(Debug, Clone)]
pub struct ClientSink {
    id: ClientId,
    tx: mpsc::Sender<Outbound>,
    buffered: Arc<AtomicU64>,
}

impl ClientSink {
    pub fn new(id: ClientId, tx: mpsc::Sender<Outbound>, buffered: Arc<AtomicU64>) -> Self {
        Self { id, tx, buffered }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn send_event(&self, event: ServerEvent) -> Result<(), GatewayError> {
        self.tx
            .send(Outbound::Event(event))
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    pub async fn send_media(&self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        self.buffered
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let len = bytes.len() as u64;
        if self.tx.send(Outbound::Media(bytes)).await.is_err() {
            self.buffered.fetch_sub(len, Ordering::Relaxed);
            return Err(GatewayError::ConnectionClosed);
        }
        Ok(())
    }

    /// Media bytes enqueued but not yet written to the socket.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Whether the sink has fallen behind the backpressure threshold.
    pub fn is_slow(&self) -> bool {
        self.buffered_bytes() > MAX_CLIENT_BUFFER_BYTES
    }
}

// ── Per-client bookkeeping ───────────────────────────────────────

/// Handle to a client's interactive ADB shell, if one is open.
#[derive(Debug, Clone)]
pub struct ShellHandle {
    pub input_tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

/// Handle to a client's running HAR capture, if any.
#[derive(Debug, Clone)]
pub struct HarHandle {
    pub stop_tx: mpsc::Sender<()>,
    pub cancel: CancellationToken,
}

/// Handle to a device's running diagnostics capture.
#[derive(Debug, Clone)]
pub struct DiagnosticsHandle {
    /// Client that started the capture; its disconnect cancels it.
    pub owner: ClientId,
    pub cancel: CancellationToken,
    pub log_path: String,
}

/// A command awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub kind: &'static str,
    pub deadline: Instant,
}

pub struct ClientEntry {
    pub sink: ClientSink,
    pub session: Option<SessionId>,
    pub shell: Option<ShellHandle>,
    pub har: Option<HarHandle>,
    pub pending: HashMap<String, PendingCommand>,
}

// ── Per-session bookkeeping ──────────────────────────────────────

/// Display-mode state that must be rolled back at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayCleanup {
    Overlay,
    NativeTaskbar,
}

pub struct SessionEntry {
    pub scid: SessionId,
    pub device_id: String,
    pub owner: ClientId,
    pub phase: SessionPhase,
    pub local_port: u16,
    pub socket_name: String,
    pub android_major: u8,
    pub turn_screen_off: bool,
    pub display_cleanup: Option<DisplayCleanup>,
    /// Control frame queue; present once the control socket handshakes.
    pub control: Option<ControlQueue>,
    /// Cancels the acceptor, pumps, and server-process watchdog.
    pub cancel: CancellationToken,
    /// Cancels the control writer; fired first so the device server
    /// unblocks before the media sockets go away.
    pub control_cancel: CancellationToken,
    /// Pump and writer tasks, joined (with a timeout) at teardown.
    pub tasks: Vec<tokio::task::JoinHandle<()>>,
}

// ── Device fact cache ────────────────────────────────────────────

/// Lazily-populated per-device facts, invalidated on abnormal
/// session teardown.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFacts {
    pub android_major: Option<u8>,
    pub max_volume: Option<u8>,
}

/// Rotation settings captured before a mode changed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationState {
    pub user_rotation: Option<String>,
    pub accelerometer_rotation: Option<String>,
}

// ── ServerState ──────────────────────────────────────────────────

struct Maps {
    clients: HashMap<ClientId, ClientEntry>,
    sessions: HashMap<SessionId, SessionEntry>,
}

pub struct ServerState {
    pub config: GatewayConfig,
    /// `None` means adb was unavailable at startup: the gateway runs
    /// degraded — enumeration reports the condition, `start` fails.
    pub bus: Option<DeviceBus>,
    next_client_id: AtomicU64,
    maps: Mutex<Maps>,
    rotation: Mutex<HashMap<String, RotationState>>,
    device_facts: Mutex<HashMap<String, DeviceFacts>>,
    diagnostics: Mutex<HashMap<String, DiagnosticsHandle>>,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(config: GatewayConfig, bus: Option<DeviceBus>) -> SharedState {
        Arc::new(Self {
            config,
            bus,
            next_client_id: AtomicU64::new(1),
            maps: Mutex::new(Maps {
                clients: HashMap::new(),
                sessions: HashMap::new(),
            }),
            rotation: Mutex::new(HashMap::new()),
            device_facts: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(HashMap::new()),
        })
    }

    /// The device bus, or `ConnectionClosed`-independent degraded error.
    pub fn bus(&self) -> Result<&DeviceBus, GatewayError> {
        self.bus.as_ref().ok_or(GatewayError::AdbUnavailable)
    }

    // ── Clients ──────────────────────────────────────────────────

    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_client(&self, sink: ClientSink) {
        let mut maps = self.maps.lock().expect("state lock poisoned");
        maps.clients.insert(
            sink.id(),
            ClientEntry {
                sink,
                session: None,
                shell: None,
                har: None,
                pending: HashMap::new(),
            },
        );
    }

    pub fn remove_client(&self, id: ClientId) -> Option<ClientEntry> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .remove(&id)
    }

    pub fn client_sink(&self, id: ClientId) -> Option<ClientSink> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get(&id)
            .map(|c| c.sink.clone())
    }

    pub fn client_session(&self, id: ClientId) -> Option<SessionId> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get(&id)
            .and_then(|c| c.session)
    }

    pub fn client_count(&self) -> usize {
        self.maps.lock().expect("state lock poisoned").clients.len()
    }

    // ── Shell / HAR handles ──────────────────────────────────────

    /// Store a shell handle unless one is already open.
    pub fn set_shell(&self, id: ClientId, handle: ShellHandle) -> bool {
        let mut maps = self.maps.lock().expect("state lock poisoned");
        match maps.clients.get_mut(&id) {
            Some(entry) if entry.shell.is_none() => {
                entry.shell = Some(handle);
                true
            }
            _ => false,
        }
    }

    pub fn shell(&self, id: ClientId) -> Option<ShellHandle> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get(&id)
            .and_then(|c| c.shell.clone())
    }

    pub fn take_shell(&self, id: ClientId) -> Option<ShellHandle> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get_mut(&id)
            .and_then(|c| c.shell.take())
    }

    pub fn set_har(&self, id: ClientId, handle: HarHandle) -> bool {
        let mut maps = self.maps.lock().expect("state lock poisoned");
        match maps.clients.get_mut(&id) {
            Some(entry) if entry.har.is_none() => {
                entry.har = Some(handle);
                true
            }
            _ => false,
        }
    }

    pub fn take_har(&self, id: ClientId) -> Option<HarHandle> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get_mut(&id)
            .and_then(|c| c.har.take())
    }

    /// Clear a HAR handle only if it is the one that finished.
    pub fn clear_har(&self, id: ClientId) {
        if let Some(entry) = self
            .maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get_mut(&id)
        {
            entry.har = None;
        }
    }

    // ── Pending command correlation ──────────────────────────────

    pub fn track_pending(&self, id: ClientId, command_id: &str, kind: &'static str) {
        if let Some(entry) = self
            .maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get_mut(&id)
        {
            entry.pending.insert(
                command_id.to_string(),
                PendingCommand {
                    kind,
                    deadline: Instant::now() + crate::config::COMMAND_TIMEOUT,
                },
            );
        }
    }

    pub fn resolve_pending(&self, id: ClientId, command_id: &str) -> Option<PendingCommand> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .clients
            .get_mut(&id)
            .and_then(|c| c.pending.remove(command_id))
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Draw a scid no live session is using.
    pub fn fresh_scid(&self) -> SessionId {
        let maps = self.maps.lock().expect("state lock poisoned");
        loop {
            let scid = SessionId::random();
            if !maps.sessions.contains_key(&scid) {
                return scid;
            }
        }
    }

    /// Register a new session and attach it to its owner.
    ///
    /// Fails with `AlreadyAttached` when the owner already holds one —
    /// a client gets at most one session at a time.
    pub fn insert_session(&self, entry: SessionEntry) -> Result<(), GatewayError> {
        let mut maps = self.maps.lock().expect("state lock poisoned");
        let owner = entry.owner;
        match maps.clients.get(&owner) {
            Some(client) if client.session.is_some() => {
                return Err(GatewayError::AlreadyAttached)
            }
            Some(_) => {}
            None => return Err(GatewayError::ConnectionClosed),
        }
        let scid = entry.scid;
        maps.sessions.insert(scid, entry);
        if let Some(client) = maps.clients.get_mut(&owner) {
            client.session = Some(scid);
        }
        Ok(())
    }

    /// Remove a session record and detach it from its owner. The first
    /// caller gets the entry; later callers get `None`, which is what
    /// makes `cleanup_session` idempotent.
    pub fn remove_session(&self, scid: SessionId) -> Option<SessionEntry> {
        let mut maps = self.maps.lock().expect("state lock poisoned");
        let entry = maps.sessions.remove(&scid)?;
        if let Some(client) = maps.clients.get_mut(&entry.owner) {
            if client.session == Some(scid) {
                client.session = None;
            }
        }
        Some(entry)
    }

    pub fn session_count(&self) -> usize {
        self.maps.lock().expect("state lock poisoned").sessions.len()
    }

    /// Run a closure against a live session entry.
    pub fn with_session_mut<R>(
        &self,
        scid: SessionId,
        f: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        self.maps
            .lock()
            .expect("state lock poisoned")
            .sessions
            .get_mut(&scid)
            .map(f)
    }

    /// Apply a phase transition to a live session, logging (not
    /// propagating) a refused transition — phase bugs must never take
    /// down a teardown path.
    pub fn advance_phase(
        &self,
        scid: SessionId,
        f: impl FnOnce(&mut SessionPhase) -> Result<(), GatewayError>,
    ) {
        if let Some(Err(e)) = self.with_session_mut(scid, |entry| f(&mut entry.phase)) {
            tracing::warn!(%scid, error = %e, "session phase transition refused");
        }
    }

    /// The control queue for a client's current session, if both the
    /// session and its control socket are up.
    pub fn control_queue_for_client(&self, id: ClientId) -> Option<ControlQueue> {
        let maps = self.maps.lock().expect("state lock poisoned");
        let scid = maps.clients.get(&id)?.session?;
        let session = maps.sessions.get(&scid)?;
        if !session.phase.accepts_traffic() {
            return None;
        }
        session.control.clone()
    }

    // ── Rotation cache ───────────────────────────────────────────

    /// Record rotation settings for a device unless already recorded;
    /// the first capture wins so `cleanupAdb` restores the true
    /// pre-gateway values.
    pub fn save_rotation(&self, device: &str, rotation: RotationState) {
        self.rotation
            .lock()
            .expect("rotation lock poisoned")
            .entry(device.to_string())
            .or_insert(rotation);
    }

    pub fn take_rotation(&self, device: &str) -> Option<RotationState> {
        self.rotation
            .lock()
            .expect("rotation lock poisoned")
            .remove(device)
    }

    // ── Device facts ─────────────────────────────────────────────

    pub fn device_facts(&self, device: &str) -> DeviceFacts {
        self.device_facts
            .lock()
            .expect("facts lock poisoned")
            .get(device)
            .copied()
            .unwrap_or_default()
    }

    pub fn update_device_facts(&self, device: &str, f: impl FnOnce(&mut DeviceFacts)) {
        let mut facts = self.device_facts.lock().expect("facts lock poisoned");
        f(facts.entry(device.to_string()).or_default());
    }

    /// Forget cached facts after an abnormal teardown.
    pub fn invalidate_device_facts(&self, device: &str) {
        self.device_facts
            .lock()
            .expect("facts lock poisoned")
            .remove(device);
    }

    // ── Diagnostics registry ─────────────────────────────────────

    /// Register a diagnostics capture; at most one per device.
    pub fn try_insert_diagnostics(&self, device: &str, handle: DiagnosticsHandle) -> bool {
        let mut map = self.diagnostics.lock().expect("diagnostics lock poisoned");
        if map.contains_key(device) {
            return false;
        }
        map.insert(device.to_string(), handle);
        true
    }

    pub fn take_diagnostics(&self, device: &str) -> Option<DiagnosticsHandle> {
        self.diagnostics
            .lock()
            .expect("diagnostics lock poisoned")
            .remove(device)
    }

    /// Pull every diagnostics capture a client started (for its
    /// disconnect cleanup).
    pub fn take_diagnostics_owned_by(&self, owner: ClientId) -> Vec<DiagnosticsHandle> {
        let mut map = self.diagnostics.lock().expect("diagnostics lock poisoned");
        let devices: Vec<String> = map
            .iter()
            .filter(|(_, h)| h.owner == owner)
            .map(|(device, _)| device.clone())
            .collect();
        devices.into_iter().filter_map(|d| map.remove(&d)).collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> SharedState {
        ServerState::new(GatewayConfig::default(), None)
    }

    fn test_sink(id: ClientId) -> (ClientSink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (ClientSink::new(id, tx, Arc::new(AtomicU64::new(0))), rx)
    }

    fn test_session(scid: SessionId, owner: ClientId) -> SessionEntry {
        SessionEntry {
            scid,
            device_id: "emulator-5554".into(),
            owner,
            phase: SessionPhase::Provisioning,
            local_port: 27183,
            socket_name: format!("scrcpy_{scid}"),
            android_major: 14,
            turn_screen_off: false,
            display_cleanup: None,
            control: None,
            cancel: CancellationToken::new(),
            control_cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn one_session_per_client() {
        let state = test_state();
        let (sink, _rx) = test_sink(1);
        state.add_client(sink);

        let scid_a = state.fresh_scid();
        state.insert_session(test_session(scid_a, 1)).unwrap();

        let scid_b = state.fresh_scid();
        let err = state.insert_session(test_session(scid_b, 1)).unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyAttached));
        assert_eq!(state.session_count(), 1);
    }

    #[tokio::test]
    async fn session_for_unknown_client_rejected() {
        let state = test_state();
        let err = state
            .insert_session(test_session(SessionId::from_raw(7), 99))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn remove_session_is_single_shot() {
        let state = test_state();
        let (sink, _rx) = test_sink(1);
        state.add_client(sink);
        let scid = state.fresh_scid();
        state.insert_session(test_session(scid, 1)).unwrap();

        assert!(state.remove_session(scid).is_some());
        assert!(state.remove_session(scid).is_none());
        assert_eq!(state.client_session(1), None);
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test]
    async fn sink_gauge_tracks_media_bytes() {
        let (sink, mut rx) = test_sink(1);
        sink.send_media(vec![0u8; 100]).await.unwrap();
        assert_eq!(sink.buffered_bytes(), 100);
        assert!(!sink.is_slow());

        // The writer drains and settles the gauge.
        match rx.recv().await.unwrap() {
            Outbound::Media(bytes) => assert_eq!(bytes.len(), 100),
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shell_handle_single_per_client() {
        let state = test_state();
        let (sink, _rx) = test_sink(1);
        state.add_client(sink);

        let (tx, _rx2) = mpsc::channel(1);
        let handle = ShellHandle {
            input_tx: tx,
            cancel: CancellationToken::new(),
        };
        assert!(state.set_shell(1, handle.clone()));
        assert!(!state.set_shell(1, handle));
        assert!(state.take_shell(1).is_some());
        assert!(state.take_shell(1).is_none());
    }

    #[tokio::test]
    async fn diagnostics_one_per_device() {
        let state = test_state();
        let handle = DiagnosticsHandle {
            owner: 1,
            cancel: CancellationToken::new(),
            log_path: "x.log".into(),
        };
        assert!(state.try_insert_diagnostics("d1", handle.clone()));
        assert!(!state.try_insert_diagnostics("d1", handle.clone()));
        assert!(state.try_insert_diagnostics("d2", handle));
        assert!(state.take_diagnostics("d1").is_some());
        assert!(state.take_diagnostics("d1").is_none());
    }

    #[tokio::test]
    async fn diagnostics_taken_by_owner() {
        let state = test_state();
        for (device, owner) in [("d1", 1), ("d2", 1), ("d3", 2)] {
            state.try_insert_diagnostics(
                device,
                DiagnosticsHandle {
                    owner,
                    cancel: CancellationToken::new(),
                    log_path: format!("{device}.log"),
                },
            );
        }
        assert_eq!(state.take_diagnostics_owned_by(1).len(), 2);
        assert!(state.take_diagnostics("d1").is_none());
        assert!(state.take_diagnostics("d3").is_some());
    }

    #[test]
    fn rotation_first_capture_wins() {
        let state = test_state();
        state.save_rotation(
            "d1",
            RotationState {
                user_rotation: Some("0".into()),
                accelerometer_rotation: Some("1".into()),
            },
        );
        // A second capture (mode switch mid-session) must not clobber
        // the original values.
        state.save_rotation(
            "d1",
            RotationState {
                user_rotation: Some("3".into()),
                accelerometer_rotation: Some("0".into()),
            },
        );
        let restored = state.take_rotation("d1").unwrap();
        assert_eq!(restored.user_rotation.as_deref(), Some("0"));
        assert!(state.take_rotation("d1").is_none());
    }

    #[test]
    fn device_facts_cache() {
        let state = test_state();
        assert!(state.device_facts("d1").android_major.is_none());
        state.update_device_facts("d1", |f| f.android_major = Some(10));
        state.update_device_facts("d1", |f| f.max_volume = Some(15));
        let facts = state.device_facts("d1");
        assert_eq!(facts.android_major, Some(10));
        assert_eq!(facts.max_volume, Some(15));

        state.invalidate_device_facts("d1");
        assert!(state.device_facts("d1").android_major.is_none());
    }

    #[test]
    fn pending_commands_tracked_and_resolved() {
        let state = test_state();
        let (sink, _rx) = test_sink(1);
        state.add_client(sink);

        state.track_pending(1, "c1", "volume");
        let pending = state.resolve_pending(1, "c1").unwrap();
        assert_eq!(pending.kind, "volume");
        // The deadline is armed a full command timeout ahead.
        let remaining = pending.deadline.saturating_duration_since(Instant::now());
        assert!(remaining > crate::config::COMMAND_TIMEOUT / 2);
        assert!(state.resolve_pending(1, "c1").is_none());
    }

    #[tokio::test]
    async fn scid_is_unique_among_live_sessions() {
        let state = test_state();
        let (sink, _rx) = test_sink(1);
        state.add_client(sink);
        let scid = state.fresh_scid();
        state.insert_session(test_session(scid, 1)).unwrap();
        for _ in 0..32 {
            assert_ne!(state.fresh_scid(), scid);
        }
    }
}
