//! Device media units → client envelopes.
//!
//! Stateful per-stream translators. The video translator remembers the
//! last config dimensions so an in-band resolution change (a config
//! unit whose SPS decodes to different dimensions) can be signaled to
//! the client *before* the config envelope that carries it. Both
//! translators watch for timestamp regressions, which indicate a
//! device-side protocol bug and are surfaced as warnings.

use crate::envelope::Envelope;
use crate::wire::{self, UnitHeader};

/// Result of translating one media unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Translated {
    /// New dimensions to announce via JSON before the envelope.
    pub resolution_change: Option<(u32, u32)>,
    /// The envelope to emit, if any.
    pub envelope: Option<Envelope>,
    /// A condition worth logging; never fatal.
    pub warning: Option<&'static str>,
}

// ── Video ────────────────────────────────────────────────────────

/// Translator for the video socket.
#[derive(Debug, Default)]
pub struct VideoTranslator {
    last_dims: Option<(u32, u32)>,
    last_pts: Option<u64>,
}

impl VideoTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the dimensions from the handshake metadata so the first
    /// config unit does not read as a resolution change.
    pub fn with_initial_dims(width: u32, height: u32) -> Self {
        Self {
            last_dims: Some((width, height)),
            last_pts: None,
        }
    }

    pub fn translate(&mut self, header: UnitHeader, payload: Vec<u8>) -> Translated {
        if payload.is_empty() {
            return Translated {
                warning: Some("zero-length video unit dropped"),
                ..Default::default()
            };
        }

        if header.is_config() {
            return self.translate_config(payload);
        }

        let warning = self.check_monotonic(header.pts);
        let envelope = if wire::first_nal_type(&payload) == Some(wire::NAL_IDR) {
            Envelope::VideoKey {
                pts: header.pts,
                payload,
            }
        } else {
            Envelope::VideoDelta {
                pts: header.pts,
                payload,
            }
        };
        Translated {
            resolution_change: None,
            envelope: Some(envelope),
            warning,
        }
    }

    fn translate_config(&mut self, payload: Vec<u8>) -> Translated {
        match wire::parse_config_sps(&payload) {
            Some(info) => {
                let dims = (info.width, info.height);
                let resolution_change = if self.last_dims != Some(dims) && self.last_dims.is_some()
                {
                    Some(dims)
                } else {
                    None
                };
                self.last_dims = Some(dims);
                Translated {
                    resolution_change,
                    envelope: Some(Envelope::VideoConfig {
                        profile: info.profile_idc,
                        compat: info.constraint_flags,
                        level: info.level_idc,
                        payload,
                    }),
                    warning: None,
                }
            }
            None => Translated {
                // Forward it anyway — the decoder may cope — but with
                // zeroed header bytes and a note in the log.
                resolution_change: None,
                envelope: Some(Envelope::VideoConfig {
                    profile: 0,
                    compat: 0,
                    level: 0,
                    payload,
                }),
                warning: Some("video config unit without a leading SPS"),
            },
        }
    }

    fn check_monotonic(&mut self, pts: u64) -> Option<&'static str> {
        let regressed = self.last_pts.is_some_and(|last| pts < last);
        self.last_pts = Some(pts);
        regressed.then_some("video timestamp regression")
    }
}

// ── Audio ────────────────────────────────────────────────────────

/// Translator for the audio socket.
#[derive(Debug, Default)]
pub struct AudioTranslator {
    last_pts: Option<u64>,
}

impl AudioTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, header: UnitHeader, payload: Vec<u8>) -> Translated {
        if payload.is_empty() {
            return Translated {
                warning: Some("zero-length audio unit dropped"),
                ..Default::default()
            };
        }

        if header.is_config() {
            return Translated {
                resolution_change: None,
                envelope: Some(Envelope::AudioConfig { payload }),
                warning: None,
            };
        }

        let regressed = self.last_pts.is_some_and(|last| header.pts < last);
        self.last_pts = Some(header.pts);
        Translated {
            resolution_change: None,
            envelope: Some(Envelope::AudioFrame {
                pts: header.pts,
                payload,
            }),
            warning: regressed.then_some("audio timestamp regression"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FLAG_CONFIG, FLAG_KEY_FRAME};

    fn header(pts: u64, flags: u8, len: u32) -> UnitHeader {
        UnitHeader { pts, flags, len }
    }

    /// A baseline SPS for 1280×768 wrapped in an Annex-B config unit.
    fn config_unit(width_mbs_minus1: u32, height_units_minus1: u32) -> Vec<u8> {
        let sps_payload = crate::sps::tests_support::build_sps(
            width_mbs_minus1,
            height_units_minus1,
        );
        let mut unit = vec![0, 0, 0, 1, 0x67];
        unit.extend_from_slice(&sps_payload);
        unit.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]); // PPS
        unit
    }

    #[test]
    fn first_config_with_seeded_dims_is_not_a_resolution_change() {
        let mut t = VideoTranslator::with_initial_dims(1280, 768);
        let unit = config_unit(79, 47); // 1280×768
        let out = t.translate(header(0, FLAG_CONFIG, unit.len() as u32), unit);
        assert_eq!(out.resolution_change, None);
        match out.envelope.unwrap() {
            Envelope::VideoConfig { profile, .. } => assert_eq!(profile, 66),
            other => panic!("expected config envelope, got {other:?}"),
        }
    }

    #[test]
    fn changed_dims_signal_resolution_change() {
        let mut t = VideoTranslator::with_initial_dims(1280, 768);
        let unit = config_unit(39, 29); // 640×480
        let out = t.translate(header(0, FLAG_CONFIG, unit.len() as u32), unit);
        assert_eq!(out.resolution_change, Some((640, 480)));

        // Re-sending the same config: envelope yes, announcement no.
        let unit = config_unit(39, 29);
        let out = t.translate(header(0, FLAG_CONFIG, unit.len() as u32), unit);
        assert_eq!(out.resolution_change, None);
        assert!(out.envelope.is_some());
    }

    #[test]
    fn idr_tagged_key_others_delta() {
        let mut t = VideoTranslator::new();
        let idr = vec![0, 0, 0, 1, 0x65, 0xAA];
        let out = t.translate(header(100, FLAG_KEY_FRAME, 6), idr);
        assert!(matches!(out.envelope, Some(Envelope::VideoKey { pts: 100, .. })));

        let p_frame = vec![0, 0, 0, 1, 0x41, 0x9A];
        let out = t.translate(header(200, 0, 6), p_frame);
        assert!(matches!(
            out.envelope,
            Some(Envelope::VideoDelta { pts: 200, .. })
        ));
    }

    #[test]
    fn zero_length_unit_dropped_with_warning() {
        let mut t = VideoTranslator::new();
        let out = t.translate(header(1, 0, 0), Vec::new());
        assert!(out.envelope.is_none());
        assert!(out.warning.is_some());

        let mut a = AudioTranslator::new();
        let out = a.translate(header(1, 0, 0), Vec::new());
        assert!(out.envelope.is_none());
        assert!(out.warning.is_some());
    }

    #[test]
    fn timestamp_regression_is_surfaced() {
        let mut t = VideoTranslator::new();
        let frame = |pts| (header(pts, 0, 4), vec![0, 0, 1, 0x41]);

        let (h, p) = frame(100);
        assert!(t.translate(h, p).warning.is_none());
        let (h, p) = frame(200);
        assert!(t.translate(h, p).warning.is_none());
        let (h, p) = frame(150);
        assert_eq!(t.translate(h, p).warning, Some("video timestamp regression"));
        // Equal timestamps are fine.
        let (h, p) = frame(150);
        assert!(t.translate(h, p).warning.is_none());
    }

    #[test]
    fn audio_config_and_frames() {
        let mut a = AudioTranslator::new();
        let asc = vec![0x12, 0x10];
        let out = a.translate(header(0, FLAG_CONFIG, 2), asc.clone());
        assert_eq!(out.envelope, Some(Envelope::AudioConfig { payload: asc }));

        let out = a.translate(header(5_000, 0, 2), vec![0xFF, 0xF1]);
        assert!(matches!(
            out.envelope,
            Some(Envelope::AudioFrame { pts: 5_000, .. })
        ));
    }

    #[test]
    fn config_without_sps_forwarded_with_warning() {
        let mut t = VideoTranslator::new();
        let unit = vec![0, 0, 0, 1, 0x68, 0xCE]; // PPS only
        let out = t.translate(header(0, FLAG_CONFIG, 6), unit);
        assert!(out.warning.is_some());
        assert!(matches!(
            out.envelope,
            Some(Envelope::VideoConfig { profile: 0, .. })
        ));
    }
}
