//! H.264 Annex-B helpers: NAL unit splitting, SPS parsing and SEI user data.

use bytes::Bytes;
use memchr::memmem;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const SEI_USER_DATA_REGISTERED: u32 = 4;

pub fn nal_type(unit: &[u8]) -> u8 {
    unit.first().map_or(0, |b| b & 0x1F)
}

/// Split an Annex-B byte stream into NAL units, start codes removed.
///
/// Bytes before the first start code are ignored.
pub fn split_nal_units(data: &Bytes) -> Vec<Bytes> {
    let starts: Vec<usize> = memmem::find_iter(data.as_ref(), &[0u8, 0, 1]).collect();
    let mut units = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let begin = start + 3;
        let mut end = starts.get(i + 1).copied().unwrap_or(data.len());
        // Trailing zero bytes belong to the next (four-byte) start code.
        while end > begin && data[end - 1] == 0 {
            end -= 1;
        }
        if end > begin {
            units.push(data.slice(begin..end));
        }
    }
    units
}

/// Remove emulation prevention bytes (`00 00 03`).
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 0x01;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_bits(&mut self, n: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some((1u32 << leading_zeros) - 1 + suffix)
    }

    fn read_se(&mut self) -> Option<i32> {
        let ue = self.read_ue()?;
        let magnitude = ue.div_ceil(2) as i32;
        Some(if ue % 2 == 0 { -magnitude } else { magnitude })
    }

    fn skip_scaling_list(&mut self, size: usize) -> Option<()> {
        let mut last = 8i32;
        let mut next = 8i32;
        for _ in 0..size {
            if next != 0 {
                let delta = self.read_se()?;
                next = (last + delta + 256) % 256;
            }
            if next != 0 {
                last = next;
            }
        }
        Some(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

/// Parse a sequence parameter set NAL unit (NAL header byte included).
pub fn parse_sps(sps: &[u8]) -> Option<SpsInfo> {
    if sps.len() < 4 || nal_type(sps) != NAL_SPS {
        return None;
    }
    let codec = format!("avc1.{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]);
    let rbsp = unescape_rbsp(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(16)?; // constraint flags + level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?;
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    r.skip_scaling_list(if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    match r.read_ue()? {
        0 => {
            r.read_ue()?;
        }
        1 => {
            r.read_bit()?;
            r.read_se()?;
            r.read_se()?;
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag
    let width_mbs = r.read_ue()? + 1;
    let height_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };
    let width = (width_mbs * 16).checked_sub((crop_left + crop_right) * crop_unit_x)?;
    let height = ((2 - frame_mbs_only) * height_map_units * 16)
        .checked_sub((crop_top + crop_bottom) * crop_unit_y)?;

    Some(SpsInfo {
        codec,
        width,
        height,
    })
}

/// Collect `user_data_registered_itu_t_t35` payloads (closed captions) from an SEI NAL unit.
pub fn sei_user_data(sei: &[u8]) -> Vec<Bytes> {
    let rbsp = unescape_rbsp(sei.get(1..).unwrap_or_default());
    let mut payloads = Vec::new();
    let mut offset = 0;
    while offset < rbsp.len() {
        // rbsp_trailing_bits
        if rbsp.len() - offset <= 1 {
            break;
        }
        let mut payload_type = 0u32;
        while offset < rbsp.len() && rbsp[offset] == 0xFF {
            payload_type += 255;
            offset += 1;
        }
        let Some(&last) = rbsp.get(offset) else {
            break;
        };
        payload_type += last as u32;
        offset += 1;

        let mut payload_size = 0usize;
        while offset < rbsp.len() && rbsp[offset] == 0xFF {
            payload_size += 255;
            offset += 1;
        }
        let Some(&last) = rbsp.get(offset) else {
            break;
        };
        payload_size += last as usize;
        offset += 1;

        let end = offset + payload_size;
        if end > rbsp.len() {
            break;
        }
        if payload_type == SEI_USER_DATA_REGISTERED {
            payloads.push(Bytes::copy_from_slice(&rbsp[offset..end]));
        }
        offset = end;
    }
    payloads
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Baseline SPS for 64x64, profile 66 level 30.
    pub(crate) const SPS_64X64: [u8; 7] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x21, 0x32];
    pub(crate) const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

    #[test]
    fn test_split_nal_units_three_and_four_byte_start_codes() {
        let data = Bytes::from_static(&[
            0xAA, 0x00, 0x00, 0x00, 0x01, 0x09, 0xF0, 0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00,
            0x00, 0x01, 0x41, 0x9A,
        ]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[0x09, 0xF0]);
        assert_eq!(&units[1][..], &[0x65, 0x88]);
        assert_eq!(&units[2][..], &[0x41, 0x9A]);
        assert_eq!(nal_type(&units[1]), NAL_IDR);
    }

    #[test]
    fn test_parse_sps_dimensions() {
        let info = parse_sps(&SPS_64X64).unwrap();
        assert_eq!(info.codec, "avc1.42c01e");
        assert_eq!(info.width, 64);
        assert_eq!(info.height, 64);
    }

    #[test]
    fn test_unescape_rbsp() {
        assert_eq!(
            unescape_rbsp(&[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03]),
            vec![0x00, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sei_user_data_extraction() {
        let sei = [0x06, 0x04, 0x03, 0xB5, 0x00, 0x31, 0x80];
        let payloads = sei_user_data(&sei);
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], &[0xB5, 0x00, 0x31]);
    }
}
