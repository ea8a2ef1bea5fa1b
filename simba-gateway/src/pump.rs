//! MediaPump — device media socket → client sink.
//!
//! One pump task per media socket. Each iteration reads a framed unit,
//! translates it to a client envelope, and forwards it. When the
//! client sink is slow (buffered media above the threshold) droppable
//! envelopes are shed; configs and key frames always go through.
//!
//! A read error or EOF ends the pump; the session supervisor observes
//! the exit and drains the session.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use simba_core::envelope::Envelope;
use simba_core::error::GatewayError;
use simba_core::message::ServerEvent;
use simba_core::translate::{AudioTranslator, Translated, VideoTranslator};
use simba_core::wire;

use crate::state::ClientSink;

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// Device closed the stream at a unit boundary.
    Eof,
    /// Cancelled by session teardown.
    Cancelled,
    /// Socket or client error.
    Failed(GatewayError),
}

/// Per-pump counters, logged at exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct PumpStats {
    pub forwarded: u64,
    pub dropped: u64,
}

enum StreamKind {
    Video(VideoTranslator),
    Audio(AudioTranslator),
}

impl StreamKind {
    fn translate(&mut self, header: wire::UnitHeader, payload: Vec<u8>) -> Translated {
        match self {
            StreamKind::Video(t) => t.translate(header, payload),
            StreamKind::Audio(t) => t.translate(header, payload),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StreamKind::Video(_) => "video",
            StreamKind::Audio(_) => "audio",
        }
    }
}

/// Run the video pump. `initial_dims` seeds the resolution tracker
/// from the handshake so the first config is not a "change".
pub async fn run_video_pump<R>(
    socket: R,
    sink: ClientSink,
    initial_dims: (u32, u32),
    cancel: CancellationToken,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    let translator = VideoTranslator::with_initial_dims(initial_dims.0, initial_dims.1);
    run_pump(socket, sink, StreamKind::Video(translator), cancel).await
}

/// Run the audio pump.
pub async fn run_audio_pump<R>(socket: R, sink: ClientSink, cancel: CancellationToken) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    run_pump(socket, sink, StreamKind::Audio(AudioTranslator::new()), cancel).await
}

async fn run_pump<R>(
    mut socket: R,
    sink: ClientSink,
    mut kind: StreamKind,
    cancel: CancellationToken,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    let mut stats = PumpStats::default();
    let label = kind.label();

    let exit = loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            unit = wire::read_unit(&mut socket) => unit,
        };

        let (header, payload) = match unit {
            Ok(Some(u)) => u,
            Ok(None) => break PumpExit::Eof,
            Err(e) => break PumpExit::Failed(e),
        };

        let out = kind.translate(header, payload);
        if let Some(warning) = out.warning {
            warn!(stream = label, warning);
        }

        // The resolution announcement always precedes the config
        // envelope that carries the new dimensions.
        if let Some((width, height)) = out.resolution_change {
            if sink
                .send_event(ServerEvent::ResolutionChange { width, height })
                .await
                .is_err()
            {
                break PumpExit::Failed(GatewayError::ConnectionClosed);
            }
        }

        let Some(envelope) = out.envelope else {
            continue;
        };

        if sink.is_slow() && envelope.is_droppable() {
            stats.dropped += 1;
            continue;
        }

        if let Err(e) = send_envelope(&sink, &envelope).await {
            break PumpExit::Failed(e);
        }
        stats.forwarded += 1;
    };

    debug!(
        stream = label,
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        exit = ?exit,
        "pump finished"
    );
    exit
}

async fn send_envelope(sink: &ClientSink, envelope: &Envelope) -> Result<(), GatewayError> {
    sink.send_media(envelope.encode()).await
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::state::Outbound;
    use simba_core::wire::{UnitHeader, FLAG_CONFIG, FLAG_KEY_FRAME};

    fn sink_with_gauge(capacity: usize) -> (ClientSink, mpsc::Receiver<Outbound>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(capacity);
        let gauge = Arc::new(AtomicU64::new(0));
        (ClientSink::new(1, tx, gauge.clone()), rx, gauge)
    }

    async fn write_unit(
        stream: &mut tokio::io::DuplexStream,
        pts: u64,
        flags: u8,
        payload: &[u8],
    ) {
        let header = UnitHeader {
            pts,
            flags,
            len: payload.len() as u32,
        };
        stream.write_all(&header.encode()).await.unwrap();
        stream.write_all(payload).await.unwrap();
    }

    #[tokio::test]
    async fn audio_pump_forwards_config_and_frames() {
        let (mut device, socket) = tokio::io::duplex(4096);
        let (sink, mut rx, _) = sink_with_gauge(16);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_audio_pump(socket, sink, cancel));

        write_unit(&mut device, 0, FLAG_CONFIG, &[0x12, 0x10]).await;
        write_unit(&mut device, 1_000, 0, &[0xAA]).await;
        write_unit(&mut device, 2_000, 0, &[0xBB]).await;
        drop(device);

        assert!(matches!(pump.await.unwrap(), PumpExit::Eof));

        let mut tags = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Media(bytes) = out {
                tags.push(bytes[0]);
            }
        }
        assert_eq!(tags, vec![0x20, 0x21, 0x21]);
    }

    #[tokio::test]
    async fn slow_sink_sheds_audio_frames_but_not_configs() {
        let (mut device, socket) = tokio::io::duplex(4096);
        let (sink, mut rx, gauge) = sink_with_gauge(16);
        let cancel = CancellationToken::new();

        // Pretend the writer is 9 MiB behind.
        gauge.store(9 * 1024 * 1024, std::sync::atomic::Ordering::Relaxed);

        let pump = tokio::spawn(run_audio_pump(socket, sink, cancel));

        write_unit(&mut device, 0, FLAG_CONFIG, &[0x12, 0x10]).await;
        write_unit(&mut device, 1_000, 0, &[0xAA]).await;
        write_unit(&mut device, 2_000, 0, &[0xBB]).await;
        drop(device);

        assert!(matches!(pump.await.unwrap(), PumpExit::Eof));

        let mut tags = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Media(bytes) = out {
                tags.push(bytes[0]);
            }
        }
        // Config passed through; both frames were shed.
        assert_eq!(tags, vec![0x20]);
    }

    #[tokio::test]
    async fn video_pump_never_drops_key_frames() {
        let (mut device, socket) = tokio::io::duplex(8192);
        let (sink, mut rx, gauge) = sink_with_gauge(32);
        let cancel = CancellationToken::new();

        gauge.store(9 * 1024 * 1024, std::sync::atomic::Ordering::Relaxed);

        let pump = tokio::spawn(run_video_pump(socket, sink, (1080, 2400), cancel));

        // Delta, key, delta while backpressured.
        write_unit(&mut device, 1_000, 0, &[0, 0, 0, 1, 0x41, 0x01]).await;
        write_unit(
            &mut device,
            2_000,
            FLAG_KEY_FRAME,
            &[0, 0, 0, 1, 0x65, 0x02],
        )
        .await;
        write_unit(&mut device, 3_000, 0, &[0, 0, 0, 1, 0x41, 0x03]).await;
        drop(device);

        assert!(matches!(pump.await.unwrap(), PumpExit::Eof));

        let mut tags = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Media(bytes) = out {
                tags.push(bytes[0]);
            }
        }
        // Only the key frame survived the pressure.
        assert_eq!(tags, vec![0x11]);
    }

    #[tokio::test]
    async fn cancel_stops_pump() {
        let (_device, socket) = tokio::io::duplex(64);
        let (sink, _rx, _) = sink_with_gauge(4);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_audio_pump(socket, sink, cancel.clone()));
        cancel.cancel();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, PumpExit::Cancelled));
    }

    #[tokio::test]
    async fn truncated_unit_fails_pump() {
        let (mut device, socket) = tokio::io::duplex(64);
        let (sink, _rx, _) = sink_with_gauge(4);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_audio_pump(socket, sink, cancel));
        device.write_all(&[0u8; 5]).await.unwrap();
        drop(device);

        assert!(matches!(pump.await.unwrap(), PumpExit::Failed(_)));
    }
}
