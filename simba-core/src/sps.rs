//! Minimal H.264 sequence-parameter-set parsing.
//!
//! The device signals a resolution change in-band by sending a new
//! config unit; the new dimensions are only available inside the SPS,
//! so the gateway decodes just enough of it: the three profile bytes
//! and the coded frame dimensions. Everything after the cropping
//! window is ignored.

use crate::error::GatewayError;

/// Fields extracted from an SPS NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

// ── Bit reader ───────────────────────────────────────────────────

/// MSB-first bit reader over an RBSP byte slice.
struct BitReader<'a> {
    data: &'a [u8],
    /// Absolute bit position.
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32, GatewayError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(GatewayError::ProtocolViolation("SPS truncated"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn read_bits(&mut self, count: u32) -> Result<u32, GatewayError> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb code.
    fn read_ue(&mut self) -> Result<u32, GatewayError> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(GatewayError::ProtocolViolation(
                    "Exp-Golomb prefix too long",
                ));
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(zeros)?;
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// Signed Exp-Golomb code.
    fn read_se(&mut self) -> Result<i32, GatewayError> {
        let ue = self.read_ue()?;
        // 0 → 0, 1 → 1, 2 → -1, 3 → 2, 4 → -2 …
        let magnitude = ue.div_ceil(2) as i32;
        if ue % 2 == 1 {
            Ok(magnitude)
        } else {
            Ok(-magnitude)
        }
    }
}

// ── RBSP extraction ──────────────────────────────────────────────

/// Strip emulation-prevention bytes (00 00 03 → 00 00).
fn to_rbsp(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut zeros = 0usize;
    for &b in payload {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> Result<(), GatewayError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

// ── Parse ────────────────────────────────────────────────────────

/// Profiles whose SPS carries the extended chroma/bit-depth block.
const EXTENDED_PROFILES: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

/// Parse an SPS NAL payload (the bytes after the NAL header byte).
pub fn parse_sps(payload: &[u8]) -> Result<SpsInfo, GatewayError> {
    if payload.len() < 3 {
        return Err(GatewayError::ProtocolViolation("SPS too short"));
    }
    let profile_idc = payload[0];
    let constraint_flags = payload[1];
    let level_idc = payload[2];

    let rbsp = to_rbsp(&payload[3..]);
    let mut r = BitReader::new(&rbsp);

    let _sps_id = r.read_ue()?;

    let mut chroma_format_idc = 1u32; // 4:2:0 unless stated otherwise
    let mut separate_colour_plane = false;
    if EXTENDED_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()? == 1;
        }
        let _bit_depth_luma = r.read_ue()?;
        let _bit_depth_chroma = r.read_ue()?;
        let _qpprime = r.read_bit()?;
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..list_count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            let _log2_max_poc = r.read_ue()?;
        }
        1 => {
            let _delta_always_zero = r.read_bit()?;
            let _offset_non_ref = r.read_se()?;
            let _offset_top_bottom = r.read_se()?;
            let cycles = r.read_ue()?;
            for _ in 0..cycles {
                let _offset = r.read_se()?;
            }
        }
        _ => {}
    }

    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_allowed = r.read_bit()?;

    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        let _mb_adaptive = r.read_bit()?;
    }
    let _direct_8x8 = r.read_bit()?;

    let mut crop_left = 0u32;
    let mut crop_right = 0u32;
    let mut crop_top = 0u32;
    let mut crop_bottom = 0u32;
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };
    let (sub_width_c, sub_height_c) = match chroma_array_type {
        1 => (2, 2),
        2 => (2, 1),
        _ => (1, 1),
    };
    let crop_unit_x = if chroma_array_type == 0 { 1 } else { sub_width_c };
    let crop_unit_y = if chroma_array_type == 0 {
        2 - frame_mbs_only
    } else {
        sub_height_c * (2 - frame_mbs_only)
    };

    let width = (pic_width_in_mbs_minus1 + 1) * 16 - (crop_left + crop_right) * crop_unit_x;
    let height = (2 - frame_mbs_only) * (pic_height_in_map_units_minus1 + 1) * 16
        - (crop_top + crop_bottom) * crop_unit_y;

    Ok(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        width,
        height,
    })
}

// ── Test support ─────────────────────────────────────────────────

/// Bitstream construction helpers shared by the parser tests and the
/// translator tests.
#[cfg(test)]
pub(crate) mod tests_support {
    /// MSB-first bit writer used to construct SPS bitstreams.
    pub struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        pub fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        pub fn put_bit(&mut self, v: u32) {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            if v != 0 {
                let idx = self.bytes.len() - 1;
                self.bytes[idx] |= 1 << (7 - self.bit);
            }
            self.bit = (self.bit + 1) % 8;
        }

        pub fn put_bits(&mut self, v: u32, count: u32) {
            for i in (0..count).rev() {
                self.put_bit((v >> i) & 1);
            }
        }

        pub fn put_ue(&mut self, v: u32) {
            let coded = v + 1;
            let bits = 32 - coded.leading_zeros();
            for _ in 0..bits - 1 {
                self.put_bit(0);
            }
            self.put_bits(coded, bits);
        }

        pub fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.put_bit(1);
            while self.bit != 0 {
                self.put_bit(0);
            }
            self.bytes
        }
    }

    /// Build a baseline-profile SPS payload for the given macroblock
    /// geometry, with an optional cropping window.
    pub fn build_sps_cropped(
        width_mbs_minus1: u32,
        height_map_units_minus1: u32,
        crop: Option<(u32, u32, u32, u32)>,
    ) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // sps_id
        w.put_ue(4); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type
        w.put_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(3); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed
        w.put_ue(width_mbs_minus1);
        w.put_ue(height_map_units_minus1);
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1); // direct_8x8_inference_flag
        match crop {
            Some((l, r, t, b)) => {
                w.put_bit(1);
                w.put_ue(l);
                w.put_ue(r);
                w.put_ue(t);
                w.put_ue(b);
            }
            None => w.put_bit(0),
        }
        w.put_bit(0); // vui_parameters_present_flag

        let mut payload = vec![66u8, 0xC0, 40]; // profile / constraints / level
        payload.extend_from_slice(&w.finish());
        payload
    }

    /// Uncropped variant.
    pub fn build_sps(width_mbs_minus1: u32, height_map_units_minus1: u32) -> Vec<u8> {
        build_sps_cropped(width_mbs_minus1, height_map_units_minus1, None)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::tests_support::{build_sps_cropped, BitWriter};
    use super::*;

    #[test]
    fn parses_uncropped_dimensions() {
        // 80×48 macroblocks → 1280×768.
        let sps = build_sps_cropped(79, 47, None);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.constraint_flags, 0xC0);
        assert_eq!(info.level_idc, 40);
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 768);
    }

    #[test]
    fn parses_cropped_1080p() {
        // 120×68 macroblocks with 8px bottom crop → 1920×1080.
        // For 4:2:0 frame material the vertical crop unit is 2.
        let sps = build_sps_cropped(119, 67, Some((0, 0, 0, 4)));
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn rejects_truncated_sps() {
        assert!(parse_sps(&[66]).is_err());
        let sps = build_sps_cropped(79, 47, None);
        assert!(parse_sps(&sps[..5]).is_err());
    }

    #[test]
    fn emulation_prevention_stripped() {
        assert_eq!(to_rbsp(&[0x00, 0x00, 0x03, 0x01]), vec![0x00, 0x00, 0x01]);
        assert_eq!(to_rbsp(&[0x00, 0x03, 0x00]), vec![0x00, 0x03, 0x00]);
        // A 03 after the stripped pair starts a fresh zero run.
        assert_eq!(
            to_rbsp(&[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x02]),
            vec![0x00, 0x00, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn exp_golomb_codes() {
        // ue(0)=1, ue(1)=010, ue(2)=011, ue(6)=00111
        let data = [0b1_010_011_0u8, 0b0111_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 6);
    }

    #[test]
    fn signed_exp_golomb() {
        // se: ue 0→0, 1→1, 2→-1, 3→2, 4→-2
        let cases = [(0u32, 0i32), (1, 1), (2, -1), (3, 2), (4, -2)];
        for (ue, expected) in cases {
            let mut w = BitWriter::new();
            w.put_ue(ue);
            let bytes = w.finish();
            let mut r = BitReader::new(&bytes);
            assert_eq!(r.read_se().unwrap(), expected, "ue={ue}");
        }
    }
}
