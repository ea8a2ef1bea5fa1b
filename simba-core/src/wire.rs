//! Device-side stream protocol (scrcpy wire format).
//!
//! # Handshake
//!
//! ```text
//! Device ──[0x00 dummy byte]──────────────────► Gateway   (every socket)
//! Device ──[64-byte device name]──────────────► Gateway   (first socket only)
//! Device ──[codec:u32 w:u32 h:u32]────────────► Gateway   (video socket)
//! Device ──[codec:u32]────────────────────────► Gateway   (audio socket;
//!                                                zero or EOF = no audio)
//! ```
//!
//! # Media units
//!
//! Each subsequent media unit is framed as:
//!
//! ```text
//! pts:    u64 BE   microseconds, device monotonic clock
//! flags:  u8       0x80 = config, 0x40 = key frame
//! len:    u32 BE   payload length
//! data:   [u8; len]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::GatewayError;
use crate::sps::{self, SpsInfo};

// ── Constants ────────────────────────────────────────────────────

/// Every socket handshake starts with this byte.
pub const DUMMY_BYTE: u8 = 0x00;

/// Fixed width of the device-name record on the first socket.
pub const DEVICE_NAME_LEN: usize = 64;

/// Codec id for H.264 video ("h264").
pub const CODEC_ID_H264: u32 = 0x6832_3634;

/// Codec id for AAC audio ("\0aac").
pub const CODEC_ID_AAC: u32 = 0x0061_6163;

/// Unit flag: this unit is codec configuration, not media.
pub const FLAG_CONFIG: u8 = 0x80;

/// Unit flag: this unit is a key frame.
pub const FLAG_KEY_FRAME: u8 = 0x40;

const UNIT_HEADER_LEN: usize = 13;

/// Upper bound on a single media unit; anything larger is a corrupt
/// stream rather than a frame.
pub const MAX_UNIT_LEN: u32 = 16 * 1024 * 1024;

// ── Unit header ──────────────────────────────────────────────────

/// Parsed media unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    pub pts: u64,
    pub flags: u8,
    pub len: u32,
}

impl UnitHeader {
    pub fn is_config(&self) -> bool {
        self.flags & FLAG_CONFIG != 0
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & FLAG_KEY_FRAME != 0
    }

    /// Serialize to the 13-byte wire form.
    pub fn encode(&self) -> [u8; UNIT_HEADER_LEN] {
        let mut buf = [0u8; UNIT_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.pts.to_be_bytes());
        buf[8] = self.flags;
        buf[9..13].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Parse from the 13-byte wire form.
    pub fn decode(buf: &[u8; UNIT_HEADER_LEN]) -> Self {
        Self {
            pts: u64::from_be_bytes(buf[0..8].try_into().expect("slice is 8 bytes")),
            flags: buf[8],
            len: u32::from_be_bytes(buf[9..13].try_into().expect("slice is 4 bytes")),
        }
    }
}

// ── Handshake reads ──────────────────────────────────────────────

/// Metadata read from the video socket handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMeta {
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

/// Read and validate the leading dummy byte.
pub async fn read_dummy_byte<R>(reader: &mut R) -> Result<(), GatewayError>
where
    R: AsyncRead + Unpin,
{
    let byte = reader.read_u8().await?;
    if byte != DUMMY_BYTE {
        return Err(GatewayError::HandshakeBadDummy(byte));
    }
    Ok(())
}

/// Read the fixed-width device-name record (first socket only).
///
/// The name is null-padded UTF-8; trailing padding is trimmed.
pub async fn read_device_name<R>(reader: &mut R) -> Result<String, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; DEVICE_NAME_LEN];
    reader.read_exact(&mut buf).await?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
    Ok(String::from_utf8_lossy(&buf[..end]).trim().to_string())
}

/// Read the video codec metadata and validate the codec id.
pub async fn read_video_meta<R>(reader: &mut R) -> Result<VideoMeta, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let codec_id = reader.read_u32().await?;
    if codec_id != CODEC_ID_H264 {
        return Err(GatewayError::UnsupportedCodec(codec_id));
    }
    let width = reader.read_u32().await?;
    let height = reader.read_u32().await?;
    Ok(VideoMeta {
        codec_id,
        width,
        height,
    })
}

/// Read the audio codec id.
///
/// Returns `Ok(None)` when the device reports audio as unavailable —
/// either a zero codec id or an immediate EOF. That is a normal
/// outcome, not an error.
pub async fn read_audio_codec<R>(reader: &mut R) -> Result<Option<u32>, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(None); // EOF before the codec id: no audio
        }
        filled += n;
    }
    let codec_id = u32::from_be_bytes(buf);
    if codec_id == 0 {
        return Ok(None);
    }
    if codec_id != CODEC_ID_AAC {
        return Err(GatewayError::UnsupportedCodec(codec_id));
    }
    Ok(Some(codec_id))
}

// ── Unit reads ───────────────────────────────────────────────────

/// Read the next media unit, or `None` on a clean EOF at a unit
/// boundary. EOF in the middle of a unit is an error.
pub async fn read_unit<R>(reader: &mut R) -> Result<Option<(UnitHeader, Vec<u8>)>, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; UNIT_HEADER_LEN];
    let mut filled = 0usize;
    while filled < UNIT_HEADER_LEN {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(GatewayError::SocketReset(
                "EOF inside media unit header".to_string(),
            ));
        }
        filled += n;
    }

    let header = UnitHeader::decode(&header_buf);
    if header.len > MAX_UNIT_LEN {
        return Err(GatewayError::ProtocolViolation("media unit too large"));
    }

    let mut payload = vec![0u8; header.len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

// ── NAL inspection ───────────────────────────────────────────────

/// NAL unit type of an IDR slice.
pub const NAL_IDR: u8 = 5;
/// NAL unit type of a sequence parameter set.
pub const NAL_SPS: u8 = 7;

/// Find the byte offset of the first NAL header in an Annex-B unit,
/// skipping the 3- or 4-byte start code.
fn first_nal_offset(unit: &[u8]) -> Option<usize> {
    if unit.len() >= 4 && unit[0..4] == [0, 0, 0, 1] {
        Some(4)
    } else if unit.len() >= 3 && unit[0..3] == [0, 0, 1] {
        Some(3)
    } else {
        None
    }
}

/// NAL type of the first NAL in an Annex-B unit.
pub fn first_nal_type(unit: &[u8]) -> Option<u8> {
    let offset = first_nal_offset(unit)?;
    unit.get(offset).map(|b| b & 0x1F)
}

/// Parse the SPS out of a config unit whose first NAL is an SPS.
///
/// Returns `None` when the unit does not start with an SPS NAL.
pub fn parse_config_sps(unit: &[u8]) -> Option<SpsInfo> {
    let offset = first_nal_offset(unit)?;
    if unit.get(offset)? & 0x1F != NAL_SPS {
        return None;
    }
    // SPS payload runs to the next start code (or end of unit).
    let body = &unit[offset + 1..];
    let end = find_start_code(body).unwrap_or(body.len());
    sps::parse_sps(&body[..end]).ok()
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(2)).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
        .map(|i| if i > 0 && data[i - 1] == 0 { i - 1 } else { i })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn unit_header_roundtrip() {
        let hdr = UnitHeader {
            pts: 123_456_789,
            flags: FLAG_CONFIG | FLAG_KEY_FRAME,
            len: 4096,
        };
        let decoded = UnitHeader::decode(&hdr.encode());
        assert_eq!(decoded, hdr);
        assert!(decoded.is_config());
        assert!(decoded.is_key_frame());
    }

    #[test]
    fn unit_header_wire_layout() {
        let hdr = UnitHeader {
            pts: 1,
            flags: 0,
            len: 2,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes[7], 1); // pts is big-endian
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[12], 2); // len is big-endian
    }

    #[tokio::test]
    async fn dummy_byte_accepted_and_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0x00]).await.unwrap();
        read_dummy_byte(&mut rx).await.unwrap();

        tx.write_all(&[0x42]).await.unwrap();
        let err = read_dummy_byte(&mut rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeBadDummy(0x42)));
    }

    #[tokio::test]
    async fn device_name_trimmed() {
        let (mut tx, mut rx) = tokio::io::duplex(128);
        let mut record = [0u8; DEVICE_NAME_LEN];
        record[..5].copy_from_slice(b"Pixel");
        tx.write_all(&record).await.unwrap();
        let name = read_device_name(&mut rx).await.unwrap();
        assert_eq!(name, "Pixel");
    }

    #[tokio::test]
    async fn video_meta_happy_path() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&CODEC_ID_H264.to_be_bytes()).await.unwrap();
        tx.write_all(&1080u32.to_be_bytes()).await.unwrap();
        tx.write_all(&2400u32.to_be_bytes()).await.unwrap();
        let meta = read_video_meta(&mut rx).await.unwrap();
        assert_eq!(meta.width, 1080);
        assert_eq!(meta.height, 2400);
    }

    #[tokio::test]
    async fn video_meta_unknown_codec() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&0xDEADBEEFu32.to_be_bytes()).await.unwrap();
        let err = read_video_meta(&mut rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedCodec(0xDEADBEEF)));
    }

    #[tokio::test]
    async fn audio_codec_aac() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&CODEC_ID_AAC.to_be_bytes()).await.unwrap();
        assert_eq!(read_audio_codec(&mut rx).await.unwrap(), Some(CODEC_ID_AAC));
    }

    #[tokio::test]
    async fn audio_codec_zero_means_disabled() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert_eq!(read_audio_codec(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn audio_codec_eof_means_disabled() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);
        assert_eq!(read_audio_codec(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_unit_roundtrip_and_eof() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let hdr = UnitHeader {
            pts: 42,
            flags: FLAG_KEY_FRAME,
            len: 3,
        };
        tx.write_all(&hdr.encode()).await.unwrap();
        tx.write_all(&[9, 8, 7]).await.unwrap();
        drop(tx);

        let (got, payload) = read_unit(&mut rx).await.unwrap().unwrap();
        assert_eq!(got, hdr);
        assert_eq!(payload, vec![9, 8, 7]);

        // Clean EOF at a unit boundary.
        assert!(read_unit(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_unit_partial_header_is_error() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0u8; 5]).await.unwrap();
        drop(tx);
        let err = read_unit(&mut rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::SocketReset(_)));
    }

    #[test]
    fn nal_type_detection() {
        let idr = [0, 0, 0, 1, 0x65, 0xAA];
        assert_eq!(first_nal_type(&idr), Some(NAL_IDR));

        let sps = [0, 0, 1, 0x67, 66];
        assert_eq!(first_nal_type(&sps), Some(NAL_SPS));

        let garbage = [1, 2, 3];
        assert_eq!(first_nal_type(&garbage), None);
    }

}
