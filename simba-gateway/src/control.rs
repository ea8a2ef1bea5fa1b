//! ControlRouter — client → device control forwarding.
//!
//! Inbound binary frames from the owner client are enqueued into a
//! bounded queue; a single writer task per session drains it into the
//! device control socket, serializing all writes. Overflow evicts the
//! oldest expendable frame (touch MOVE) — UP/DOWN and power events are
//! never displaced, and when nothing is expendable the newest frame is
//! rejected instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use simba_core::control;
use simba_core::error::GatewayError;

use crate::config::CONTROL_QUEUE_CAPACITY;

// ── Queue ────────────────────────────────────────────────────────

/// Outcome of enqueuing a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full; an older touch-MOVE frame was evicted to
    /// make room.
    EvictedOlder,
    /// The queue was full of essential frames; this frame was refused.
    Rejected,
    /// The queue is closed (session draining).
    Closed,
}

struct Inner {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: tokio::sync::Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

/// Bounded control-frame queue shared between the gateway reader and
/// the per-session writer task.
#[derive(Clone)]
pub struct ControlQueue {
    inner: Arc<Inner>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::with_capacity(CONTROL_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                notify: tokio::sync::Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Enqueue a frame, applying the overflow policy.
    pub fn push(&self, frame: Vec<u8>) -> PushOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut queue = self.inner.queue.lock().expect("control queue poisoned");
            if queue.len() >= self.inner.capacity {
                if let Some(victim) = queue.iter().position(|f| control::is_droppable(f)) {
                    queue.remove(victim);
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    queue.push_back(frame);
                    PushOutcome::EvictedOlder
                } else {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::Rejected
                }
            } else {
                queue.push_back(frame);
                PushOutcome::Enqueued
            }
        };
        if outcome != PushOutcome::Rejected {
            self.inner.notify.notify_one();
        }
        outcome
    }

    /// Dequeue the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            // Arm the notification before checking the queue so a
            // push between the check and the await is not lost.
            let notified = self.inner.notify.notified();
            if let Some(frame) = self
                .inner
                .queue
                .lock()
                .expect("control queue poisoned")
                .pop_front()
            {
                return Some(frame);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Refuse further enqueues and wake the writer.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("control queue poisoned").len()
    }

    /// Frames discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ControlQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Writer task ──────────────────────────────────────────────────

/// Drain the control queue into the device control socket.
///
/// Returns `Ok` when cancelled or the queue closes; a write error is
/// returned so the session supervisor can drain the session.
pub async fn run_control_writer(
    queue: ControlQueue,
    mut socket: OwnedWriteHalf,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(dropped = queue.dropped(), "control writer cancelled");
                return Ok(());
            }
            frame = queue.pop() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        if let Err(e) = socket.write_all(&frame).await {
            warn!(error = %e, "control socket write failed");
            return Err(GatewayError::SocketWriteError(e.to_string()));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
