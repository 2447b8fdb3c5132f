//! # Sequence Parameter Sets
//!
//! Just enough of the H.264 SPS syntax (ITU-T H.264 §7.3.2.1.1) to recover
//! the profile, level and display dimensions a format description needs,
//! plus a writer for the constrained-baseline SPS emitted by the reference
//! engine. VUI parameters are neither parsed nor written.
//!
//! ```text
//!  header | profile_idc | constraints | level_idc | ue(sps_id) | ...
//!    u8   |     u8      |     u8      |    u8     |  exp-Golomb fields
//! ```

use bytes::Bytes;
use serde::Serialize;

use crate::emulation;
use crate::error::CodecError;
use vidlink_transport::nal::NAL_TYPE_SPS;

/// Profiles whose SPS carries chroma format, bit depth and scaling lists.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

pub const PROFILE_BASELINE: u8 = 66;
pub const PROFILE_MAIN: u8 = 77;
pub const PROFILE_HIGH: u8 = 100;

// ─── Bit Reader ──────────────────────────────────────────────────────────────

/// MSB-first reader over an RBSP.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0 }
    }

    pub fn bits_read(&self) -> usize {
        self.pos
    }

    pub fn bits_left(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    pub fn read_bit(&mut self) -> Result<bool, CodecError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(CodecError::UnexpectedEnd { bits: self.pos })?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read `n` (≤ 32) bits as an unsigned integer.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, CodecError> {
        debug_assert!(n <= 32);
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | u32::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Unsigned exp-Golomb, `ue(v)`.
    pub fn read_ue(&mut self) -> Result<u32, CodecError> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(CodecError::GolombOverflow);
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }

    /// Signed exp-Golomb, `se(v)`.
    pub fn read_se(&mut self) -> Result<i32, CodecError> {
        let k = self.read_ue()?;
        let magnitude = ((k as i64 + 1) / 2) as i32;
        Ok(if k % 2 == 1 { magnitude } else { -magnitude })
    }
}

// ─── Bit Writer ──────────────────────────────────────────────────────────────

/// MSB-first writer producing an RBSP.
#[derive(Default)]
pub struct BitWriter {
    out: Vec<u8>,
    acc: u8,
    filled: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.acc = (self.acc << 1) | u8::from(bit);
        self.filled += 1;
        if self.filled == 8 {
            self.out.push(self.acc);
            self.acc = 0;
            self.filled = 0;
        }
    }

    pub fn write_bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_ue(&mut self, value: u32) {
        let coded = u64::from(value) + 1;
        let len = 64 - coded.leading_zeros();
        self.write_bits(0, len - 1);
        for i in (0..len).rev() {
            self.write_bit((coded >> i) & 1 == 1);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(mapped);
    }

    /// Append `rbsp_trailing_bits()` and return the byte-aligned RBSP.
    pub fn finish_rbsp(mut self) -> Vec<u8> {
        self.write_bit(true);
        while self.filled != 0 {
            self.write_bit(false);
        }
        self.out
    }
}

// ─── SPS ─────────────────────────────────────────────────────────────────────

/// Frame cropping offsets, in crop units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cropping {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// The fields of an SPS vidlink uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub frame_mbs_only: bool,
    pub width_in_mbs: u32,
    pub height_in_map_units: u32,
    pub cropping: Cropping,
    /// Display width in luma samples, after cropping.
    pub width: u32,
    /// Display height in luma samples, after cropping.
    pub height: u32,
}

impl SpsInfo {
    /// Parse a complete SPS NAL unit (header byte included, emulation
    /// prevention bytes still present).
    pub fn parse(nal: &[u8]) -> Result<Self, CodecError> {
        let (&header, body) = nal
            .split_first()
            .ok_or(CodecError::UnexpectedEnd { bits: 0 })?;
        if header & 0x1F != NAL_TYPE_SPS {
            return Err(CodecError::WrongNalType {
                expected: NAL_TYPE_SPS,
                found: header & 0x1F,
            });
        }
        let rbsp = emulation::unescape(body);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = r.read_u8()?;
        let constraint_flags = r.read_u8()?;
        let level_idc = r.read_u8()?;
        let sps_id = r.read_ue()?;
        if sps_id > 31 {
            return Err(CodecError::MalformedSps("sps id out of range"));
        }

        let mut chroma_format_idc = 1;
        let mut separate_colour_plane = false;
        if HIGH_PROFILES.contains(&profile_idc) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc > 3 {
                return Err(CodecError::MalformedSps("chroma_format_idc out of range"));
            }
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()?;
            }
            let _bit_depth_luma = r.read_ue()?;
            let _bit_depth_chroma = r.read_ue()?;
            let _qpprime_bypass = r.read_bit()?;
            if r.read_bit()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num = r.read_ue()?;
        match r.read_ue()? {
            0 => {
                let _log2_max_poc_lsb = r.read_ue()?;
            }
            1 => {
                let _delta_pic_order_always_zero = r.read_bit()?;
                let _offset_for_non_ref_pic = r.read_se()?;
                let _offset_top_to_bottom = r.read_se()?;
                let cycle = r.read_ue()?;
                if cycle > 255 {
                    return Err(CodecError::MalformedSps("poc cycle too long"));
                }
                for _ in 0..cycle {
                    r.read_se()?;
                }
            }
            2 => {}
            _ => return Err(CodecError::MalformedSps("unknown pic_order_cnt_type")),
        }

        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_allowed = r.read_bit()?;
        let width_in_mbs = r.read_ue()? + 1;
        let height_in_map_units = r.read_ue()? + 1;
        let frame_mbs_only = r.read_bit()?;
        if !frame_mbs_only {
            let _mb_adaptive_frame_field = r.read_bit()?;
        }
        let _direct_8x8_inference = r.read_bit()?;

        let mut cropping = Cropping::default();
        if r.read_bit()? {
            cropping.left = r.read_ue()?;
            cropping.right = r.read_ue()?;
            cropping.top = r.read_ue()?;
            cropping.bottom = r.read_ue()?;
        }

        let field_factor = if frame_mbs_only { 1 } else { 2 };
        let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
        let (crop_x, crop_y) = match chroma_array_type {
            0 => (1, field_factor),
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };

        let full_width = width_in_mbs
            .checked_mul(16)
            .ok_or(CodecError::MalformedSps("width overflow"))?;
        let full_height = height_in_map_units
            .checked_mul(16 * field_factor)
            .ok_or(CodecError::MalformedSps("height overflow"))?;
        let crop_w = (cropping.left as u64 + cropping.right as u64) * crop_x as u64;
        let crop_h = (cropping.top as u64 + cropping.bottom as u64) * crop_y as u64;
        if crop_w >= full_width as u64 || crop_h >= full_height as u64 {
            return Err(CodecError::MalformedSps("cropping exceeds picture"));
        }

        Ok(SpsInfo {
            profile_idc,
            constraint_flags,
            level_idc,
            sps_id,
            chroma_format_idc,
            frame_mbs_only,
            width_in_mbs,
            height_in_map_units,
            cropping,
            width: full_width - crop_w as u32,
            height: full_height - crop_h as u32,
        })
    }

    /// A 4:2:0 constrained-baseline, progressive, intra-only SPS for the given
    /// display size. Odd dimensions are rounded up to even.
    pub fn baseline(width: u32, height: u32, level_idc: u8) -> Self {
        let width = width.max(2).next_multiple_of(2);
        let height = height.max(2).next_multiple_of(2);
        let width_in_mbs = width.div_ceil(16);
        let height_in_map_units = height.div_ceil(16);
        SpsInfo {
            profile_idc: PROFILE_BASELINE,
            constraint_flags: 0xC0,
            level_idc,
            sps_id: 0,
            chroma_format_idc: 1,
            frame_mbs_only: true,
            width_in_mbs,
            height_in_map_units,
            cropping: Cropping {
                left: 0,
                right: (width_in_mbs * 16 - width) / 2,
                top: 0,
                bottom: (height_in_map_units * 16 - height) / 2,
            },
            width,
            height,
        }
    }

    /// Serialize as a complete SPS NAL unit (header `0x67`, escaped).
    ///
    /// Only the baseline layout produced by [`SpsInfo::baseline`] is written:
    /// no high-profile fields, `pic_order_cnt_type` 2, no VUI.
    pub fn to_nal(&self) -> Bytes {
        let mut w = BitWriter::new();
        w.write_bits(u32::from(self.profile_idc), 8);
        w.write_bits(u32::from(self.constraint_flags), 8);
        w.write_bits(u32::from(self.level_idc), 8);
        w.write_ue(self.sps_id);
        w.write_ue(0); // log2_max_frame_num_minus4
        w.write_ue(2); // pic_order_cnt_type
        w.write_ue(0); // max_num_ref_frames
        w.write_bit(false); // gaps_in_frame_num_value_allowed_flag
        w.write_ue(self.width_in_mbs - 1);
        w.write_ue(self.height_in_map_units - 1);
        w.write_bit(self.frame_mbs_only);
        if !self.frame_mbs_only {
            w.write_bit(false);
        }
        w.write_bit(true); // direct_8x8_inference_flag
        let c = self.cropping;
        let cropped = c != Cropping::default();
        w.write_bit(cropped);
        if cropped {
            w.write_ue(c.left);
            w.write_ue(c.right);
            w.write_ue(c.top);
            w.write_ue(c.bottom);
        }
        w.write_bit(false); // vui_parameters_present_flag

        let rbsp = w.finish_rbsp();
        let mut nal = Vec::with_capacity(rbsp.len() + 2);
        nal.push(0x60 | NAL_TYPE_SPS);
        nal.extend_from_slice(&emulation::escape(&rbsp));
        Bytes::from(nal)
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), CodecError> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb_roundtrip() {
        let mut w = BitWriter::new();
        for v in [0u32, 1, 2, 3, 7, 8, 255, 1 << 20] {
            w.write_ue(v);
        }
        for v in [0i32, 1, -1, 2, -2, 1000, -1000] {
            w.write_se(v);
        }
        let rbsp = w.finish_rbsp();

        let mut r = BitReader::new(&rbsp);
        for v in [0u32, 1, 2, 3, 7, 8, 255, 1 << 20] {
            assert_eq!(r.read_ue().unwrap(), v);
        }
        for v in [0i32, 1, -1, 2, -2, 1000, -1000] {
            assert_eq!(r.read_se().unwrap(), v);
        }
        assert!(r.read_bit().unwrap(), "trailing stop bit");
    }

    #[test]
    fn ue_known_codes() {
        // 1 | 010 | 011 | 00100  →  0, 1, 2, 3
        let data = [0b1010_0110, 0b0100_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn reader_reports_end() {
        let mut r = BitReader::new(&[0x00]);
        assert_eq!(r.read_ue(), Err(CodecError::UnexpectedEnd { bits: 8 }));
    }

    #[test]
    fn parses_baseline_with_vui() {
        // Baseline 3.0, 640x480, poc type 0, VUI with timing info.
        let sps = [
            0x67, 0x42, 0xC0, 0x1E, 0xED, 0x01, 0x40, 0x7B, 0x42, 0x00, 0x00, 0x03, 0x00, 0x02,
            0x00, 0x00, 0x03, 0x00, 0x79, 0x08,
        ];
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!(info.profile_idc, PROFILE_BASELINE);
        assert_eq!(info.level_idc, 30);
        assert_eq!((info.width, info.height), (640, 480));
    }

    #[test]
    fn parses_high_profile_with_scaling_and_cropping() {
        // High 4.0, 1920x1080 (1088 coded, 8 lines cropped), poc type 1,
        // one explicit scaling list.
        let sps = [
            0x67, 0x64, 0x00, 0x28, 0xAD, 0x84, 0x40, 0x50, 0xB6, 0x99, 0x40, 0x78, 0x02, 0x27,
            0xE5, 0x40,
        ];
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!(info.profile_idc, PROFILE_HIGH);
        assert_eq!(info.chroma_format_idc, 1);
        assert_eq!(info.cropping.bottom, 4);
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn parses_interlaced_main_profile() {
        // Main 3.0, 720x576 coded as field pairs.
        let sps = [0x67, 0x4D, 0x40, 0x1E, 0xDA, 0x02, 0xD0, 0x93, 0x20];
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!(info.profile_idc, PROFILE_MAIN);
        assert!(!info.frame_mbs_only);
        assert_eq!((info.width, info.height), (720, 576));
    }

    #[test]
    fn baseline_writer_and_parser_agree() {
        for (w, h) in [(640, 480), (1280, 720), (1920, 1080), (176, 144), (34, 18)] {
            let written = SpsInfo::baseline(w, h, 31);
            let nal = written.to_nal();
            assert_eq!(nal[0], 0x67);
            let parsed = SpsInfo::parse(&nal).unwrap();
            assert_eq!(parsed, written, "{w}x{h}");
            assert_eq!((parsed.width, parsed.height), (w, h));
        }
    }

    #[test]
    fn rejects_non_sps_and_truncation() {
        assert_eq!(
            SpsInfo::parse(&[0x68, 0xCE, 0x38, 0x80]),
            Err(CodecError::WrongNalType {
                expected: NAL_TYPE_SPS,
                found: 8
            })
        );
        let nal = SpsInfo::baseline(640, 480, 30).to_nal();
        assert!(SpsInfo::parse(&nal[..5]).is_err());
        assert!(SpsInfo::parse(&[]).is_err());
    }
}
