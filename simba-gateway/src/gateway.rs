//! ClientGateway — WebSocket accept loop and per-connection routing.
//!
//! Text frames are JSON commands dispatched to the CommandHub; binary
//! frames are control input forwarded to the owner session. A closing
//! connection tears down everything the client owned: its session, its
//! interactive shell, and any diagnostics or HAR capture it started.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use simba_core::message::{parse_client_command, ParseFailure, ServerEvent};

use crate::commands;
use crate::control::PushOutcome;
use crate::session::{self, CleanupCause};
use crate::state::{ClientSink, Outbound, SharedState};

/// Outbound channel depth per client; media backpressure is handled
/// by the byte gauge, this only bounds memory for the channel itself.
const CLIENT_CHANNEL_DEPTH: usize = 256;

/// Accept WebSocket clients until cancelled by process shutdown.
pub async fn run(state: SharedState) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.websocket_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("websocket listener on {addr}");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(state, ws, peer).await,
                        Err(e) => {
                            warn!(%peer, error = %e, "websocket handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "tcp accept error");
            }
        }
    }
}

/// Handle one client for its whole lifetime.
async fn handle_connection(
    state: SharedState,
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer: SocketAddr,
) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    let client_id = state.next_client_id();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CLIENT_CHANNEL_DEPTH);
    let buffered = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let sink = ClientSink::new(client_id, tx, buffered.clone());
    state.add_client(sink.clone());
    info!(
        client = client_id,
        %peer,
        clients = state.client_count(),
        "client connected"
    );

    // Writer: drains the outbound channel onto the socket and settles
    // the media byte gauge once frames actually leave.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Event(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "unserializable event dropped");
                            continue;
                        }
                    };
                    ws_sink.send(Message::Text(json)).await
                }
                Outbound::Media(bytes) => {
                    let len = bytes.len() as u64;
                    let result = ws_sink.send(Message::Binary(bytes)).await;
                    buffered.fetch_sub(len, std::sync::atomic::Ordering::Relaxed);
                    result
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Reader: route frames until the connection ends.
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_text(&state, &sink, &text).await;
            }
            Ok(Message::Binary(frame)) => {
                handle_binary(&state, client_id, frame);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }

    // Connection closed: release everything this client owned.
    info!(client = client_id, %peer, "client disconnected");
    if let Some(scid) = state.client_session(client_id) {
        session::cleanup_session(&state, scid, CleanupCause::Detach).await;
    }
    if let Some(entry) = state.remove_client(client_id) {
        if let Some(shell) = entry.shell {
            shell.cancel.cancel();
        }
        if let Some(har) = entry.har {
            har.cancel.cancel();
        }
        let now = std::time::Instant::now();
        for (command_id, pending) in entry.pending {
            debug!(
                client = client_id,
                command_id,
                kind = pending.kind,
                remaining = ?pending.deadline.saturating_duration_since(now),
                "pending command failed: connection closed"
            );
        }
    }
    for handle in state.take_diagnostics_owned_by(client_id) {
        handle.cancel.cancel();
    }

    writer.abort();
}

/// Route a JSON command; parse failures answer without disconnecting.
async fn handle_text(state: &SharedState, sink: &ClientSink, text: &str) {
    match parse_client_command(text) {
        Ok(cmd) => {
            // Each command runs in its own task; correlation ids keep
            // responses matched, so concurrent commands are fine.
            let state = state.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                commands::handle_command(state, sink, cmd).await;
            });
        }
        Err(ParseFailure::UnknownAction { action, command_id }) => {
            debug!(action, "unknown action");
            let _ = sink
                .send_event(ServerEvent::Error {
                    message: "Unknown action".to_string(),
                    command_id,
                })
                .await;
        }
        Err(ParseFailure::Malformed { detail, command_id }) => {
            // Dropped with a warning; never fatal to the connection.
            warn!(detail, ?command_id, "malformed client message dropped");
        }
    }
}

/// Forward a binary control frame to the owner session, if any.
fn handle_binary(state: &SharedState, client_id: u64, frame: Vec<u8>) {
    let Some(kind) = simba_core::control::classify(&frame) else {
        warn!(client = client_id, "empty control frame dropped");
        return;
    };
    trace!(client = client_id, ?kind, len = frame.len(), "control frame");
    let Some(queue) = state.control_queue_for_client(client_id) else {
        // No session: silently dropped by contract.
        return;
    };
    match queue.push(frame) {
        PushOutcome::Enqueued => {}
        PushOutcome::EvictedOlder => {
            debug!(client = client_id, "control queue full; dropped oldest move");
        }
        PushOutcome::Rejected => {
            warn!(
                client = client_id,
                queued = queue.len(),
                "control queue full of essential frames"
            );
        }
        PushOutcome::Closed => {
            debug!(client = client_id, "control frame after drain started");
        }
    }
}
