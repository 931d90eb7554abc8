//! MPEG-1/2/2.5 audio (MP1/MP2/MP3) frame headers.

const BITRATES_V1: [[u32; 16]; 3] = [
    // Layer I
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0],
    // Layer II
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0],
    // Layer III
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
];

const BITRATES_V2: [[u32; 16]; 3] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
];

const SAMPLE_RATES: [[u32; 3]; 3] = [
    [44100, 48000, 32000],
    [22050, 24000, 16000],
    [11025, 12000, 8000],
];

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegAudioHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub samples_per_frame: u32,
    pub frame_len: usize,
}

/// 11-bit sync, a valid version and a non-zero layer.
pub fn is_header(data: &[u8], offset: usize) -> bool {
    offset + 1 < data.len()
        && data[offset] == 0xFF
        && (data[offset + 1] & 0xE0) == 0xE0
        && (data[offset + 1] & 0x18) != 0x08
        && (data[offset + 1] & 0x06) != 0x00
}

pub fn parse_header(data: &[u8], offset: usize) -> Option<MpegAudioHeader> {
    if offset + HEADER_LEN > data.len() || !is_header(data, offset) {
        return None;
    }
    let d = &data[offset..];
    let version_bits = (d[1] >> 3) & 0x03;
    let layer_bits = (d[1] >> 1) & 0x03;
    let bitrate_index = (d[2] >> 4) as usize;
    let rate_index = ((d[2] >> 2) & 0x03) as usize;
    let padding = ((d[2] >> 1) & 0x01) as u32;
    let channel_mode = d[3] >> 6;

    if rate_index == 3 {
        return None;
    }
    // 3 = MPEG-1, 2 = MPEG-2, 0 = MPEG-2.5
    let (version_row, mpeg1) = match version_bits {
        3 => (0, true),
        2 => (1, false),
        0 => (2, false),
        _ => return None,
    };
    // layer bits: 3 = Layer I, 2 = Layer II, 1 = Layer III
    let layer_row = match layer_bits {
        3 => 0,
        2 => 1,
        1 => 2,
        _ => return None,
    };

    let table = if mpeg1 { &BITRATES_V1 } else { &BITRATES_V2 };
    let bitrate = table[layer_row][bitrate_index] * 1000;
    if bitrate == 0 {
        return None;
    }
    let sample_rate = SAMPLE_RATES[version_row][rate_index];
    let samples_per_frame = match (layer_row, mpeg1) {
        (0, _) => 384,
        (1, _) => 1152,
        (_, true) => 1152,
        (_, false) => 576,
    };
    let frame_len = if layer_row == 0 {
        ((12 * bitrate / sample_rate + padding) * 4) as usize
    } else {
        (samples_per_frame / 8 * bitrate / sample_rate + padding) as usize
    };
    if frame_len < HEADER_LEN {
        return None;
    }

    Some(MpegAudioHeader {
        sample_rate,
        channels: if channel_mode == 3 { 1 } else { 2 },
        samples_per_frame,
        frame_len,
    })
}

/// A header at `offset` followed by either the end of data or another header.
pub fn probe(data: &[u8], offset: usize) -> bool {
    let Some(header) = parse_header(data, offset) else {
        return false;
    };
    let next = offset + header.frame_len;
    next == data.len() || is_header(data, next)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One MPEG-1 Layer III frame, 128 kbps, 44.1 kHz, stereo, no padding (417 bytes).
    pub(crate) fn frame(fill: u8) -> Vec<u8> {
        let mut out = vec![0xFF, 0xFB, 0x90, 0x00];
        out.extend(std::iter::repeat_n(fill, 417 - HEADER_LEN));
        out
    }

    #[test]
    fn test_parse_mp3_header() {
        let data = frame(0);
        let header = parse_header(&data, 0).unwrap();
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.samples_per_frame, 1152);
        assert_eq!(header.frame_len, 417);
        assert!(probe(&data, 0));
    }

    #[test]
    fn test_rejects_adts() {
        // ADTS sync has layer bits 00.
        let data = [0xFF, 0xF1, 0x50, 0x80];
        assert!(!is_header(&data, 0));
    }
}
