//! Client-facing binary envelopes.
//!
//! Every binary frame sent to a browser client starts with a one-byte
//! tag, followed by an optional fixed header, followed by the payload.
//!
//! ## Wire format
//!
//! ```text
//! 0x00                      Legacy H.264 access unit (no header)
//! 0x01                      Legacy AAC ADTS frame (no header)
//! 0x10 profile compat level H.264 config (SPS/PPS bundle)
//! 0x11 ts:u64 BE            H.264 key frame (IDR)
//! 0x12 ts:u64 BE            H.264 delta frame
//! 0x20                      AAC config (AudioSpecificConfig)
//! 0x21 ts:u64 BE            AAC frame
//! ```
//!
//! Timestamps are big-endian 64-bit unsigned microseconds from the
//! device monotonic clock.

use crate::error::GatewayError;

// ── Tags ─────────────────────────────────────────────────────────

/// One-byte envelope discriminant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeTag {
    /// Legacy untimed H.264 access unit (older device servers only).
    LegacyVideo = 0x00,
    /// Legacy untimed AAC ADTS frame (older device servers only).
    LegacyAudio = 0x01,
    /// H.264 SPS/PPS config bundle.
    VideoConfig = 0x10,
    /// H.264 IDR key frame.
    VideoKey = 0x11,
    /// H.264 delta frame.
    VideoDelta = 0x12,
    /// Raw AudioSpecificConfig.
    AudioConfig = 0x20,
    /// AAC frame.
    AudioFrame = 0x21,
}

impl TryFrom<u8> for EnvelopeTag {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(EnvelopeTag::LegacyVideo),
            0x01 => Ok(EnvelopeTag::LegacyAudio),
            0x10 => Ok(EnvelopeTag::VideoConfig),
            0x11 => Ok(EnvelopeTag::VideoKey),
            0x12 => Ok(EnvelopeTag::VideoDelta),
            0x20 => Ok(EnvelopeTag::AudioConfig),
            0x21 => Ok(EnvelopeTag::AudioFrame),
            other => Err(GatewayError::UnknownVariant {
                type_name: "EnvelopeTag",
                value: other as u64,
            }),
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// A decoded client envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    LegacyVideo {
        payload: Vec<u8>,
    },
    LegacyAudio {
        payload: Vec<u8>,
    },
    /// H.264 config; the three header bytes are the SPS
    /// profile_idc / constraint flags / level_idc.
    VideoConfig {
        profile: u8,
        compat: u8,
        level: u8,
        payload: Vec<u8>,
    },
    VideoKey {
        pts: u64,
        payload: Vec<u8>,
    },
    VideoDelta {
        pts: u64,
        payload: Vec<u8>,
    },
    AudioConfig {
        payload: Vec<u8>,
    },
    AudioFrame {
        pts: u64,
        payload: Vec<u8>,
    },
}

impl Envelope {
    /// The tag byte this envelope serializes with.
    pub fn tag(&self) -> EnvelopeTag {
        match self {
            Envelope::LegacyVideo { .. } => EnvelopeTag::LegacyVideo,
            Envelope::LegacyAudio { .. } => EnvelopeTag::LegacyAudio,
            Envelope::VideoConfig { .. } => EnvelopeTag::VideoConfig,
            Envelope::VideoKey { .. } => EnvelopeTag::VideoKey,
            Envelope::VideoDelta { .. } => EnvelopeTag::VideoDelta,
            Envelope::AudioConfig { .. } => EnvelopeTag::AudioConfig,
            Envelope::AudioFrame { .. } => EnvelopeTag::AudioFrame,
        }
    }

    /// The timestamp carried in the header, if this envelope type has one.
    pub fn pts(&self) -> Option<u64> {
        match self {
            Envelope::VideoKey { pts, .. }
            | Envelope::VideoDelta { pts, .. }
            | Envelope::AudioFrame { pts, .. } => Some(*pts),
            _ => None,
        }
    }

    /// The media payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Envelope::LegacyVideo { payload }
            | Envelope::LegacyAudio { payload }
            | Envelope::VideoConfig { payload, .. }
            | Envelope::VideoKey { payload, .. }
            | Envelope::VideoDelta { payload, .. }
            | Envelope::AudioConfig { payload }
            | Envelope::AudioFrame { payload, .. } => payload,
        }
    }

    /// Configs must never be dropped under backpressure.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Envelope::VideoConfig { .. } | Envelope::AudioConfig { .. }
        )
    }

    /// Whether this envelope may be dropped when the client sink is slow.
    ///
    /// Key frames and configs are always delivered; delta video frames
    /// and audio frames are expendable.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Envelope::VideoDelta { .. } | Envelope::AudioFrame { .. }
        )
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::LegacyVideo { payload } | Envelope::LegacyAudio { payload } => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(self.tag() as u8);
                buf.extend_from_slice(payload);
                buf
            }
            Envelope::VideoConfig {
                profile,
                compat,
                level,
                payload,
            } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.push(EnvelopeTag::VideoConfig as u8);
                buf.push(*profile);
                buf.push(*compat);
                buf.push(*level);
                buf.extend_from_slice(payload);
                buf
            }
            Envelope::VideoKey { pts, payload }
            | Envelope::VideoDelta { pts, payload }
            | Envelope::AudioFrame { pts, payload } => {
                let mut buf = Vec::with_capacity(9 + payload.len());
                buf.push(self.tag() as u8);
                buf.extend_from_slice(&pts.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Envelope::AudioConfig { payload } => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(EnvelopeTag::AudioConfig as u8);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Parse wire bytes back into an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, GatewayError> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or(GatewayError::ProtocolViolation("empty envelope"))?;

        match EnvelopeTag::try_from(tag)? {
            EnvelopeTag::LegacyVideo => Ok(Envelope::LegacyVideo {
                payload: rest.to_vec(),
            }),
            EnvelopeTag::LegacyAudio => Ok(Envelope::LegacyAudio {
                payload: rest.to_vec(),
            }),
            EnvelopeTag::VideoConfig => {
                if rest.len() < 3 {
                    return Err(GatewayError::ProtocolViolation(
                        "video config envelope shorter than its header",
                    ));
                }
                Ok(Envelope::VideoConfig {
                    profile: rest[0],
                    compat: rest[1],
                    level: rest[2],
                    payload: rest[3..].to_vec(),
                })
            }
            EnvelopeTag::VideoKey => {
                let (pts, payload) = split_pts(rest)?;
                Ok(Envelope::VideoKey { pts, payload })
            }
            EnvelopeTag::VideoDelta => {
                let (pts, payload) = split_pts(rest)?;
                Ok(Envelope::VideoDelta { pts, payload })
            }
            EnvelopeTag::AudioConfig => Ok(Envelope::AudioConfig {
                payload: rest.to_vec(),
            }),
            EnvelopeTag::AudioFrame => {
                let (pts, payload) = split_pts(rest)?;
                Ok(Envelope::AudioFrame { pts, payload })
            }
        }
    }
}

fn split_pts(rest: &[u8]) -> Result<(u64, Vec<u8>), GatewayError> {
    if rest.len() < 8 {
        return Err(GatewayError::ProtocolViolation(
            "timed envelope shorter than its header",
        ));
    }
    let pts = u64::from_be_bytes(rest[0..8].try_into().expect("slice is 8 bytes"));
    Ok((pts, rest[8..].to_vec()))
}

// ── Tests ────────────────────────────────────────────────────────
