//! ADTS (Audio Data Transport Stream) framing for AAC.

use bytes::Bytes;

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples per AAC frame.
pub const FRAME_SAMPLES: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1).
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channels: u8,
    pub header_len: usize,
    /// Full frame length including the header.
    pub frame_len: usize,
}

impl AdtsHeader {
    pub fn payload_len(&self) -> usize {
        self.frame_len - self.header_len
    }

    /// Two-byte AudioSpecificConfig.
    pub fn audio_specific_config(&self) -> Bytes {
        let obj = self.object_type;
        let freq = self.sample_rate_index;
        let chan = self.channels;
        Bytes::copy_from_slice(&[(obj << 3) | (freq >> 1), ((freq & 0x01) << 7) | (chan << 3)])
    }

    pub fn codec(&self) -> String {
        format!("mp4a.40.{}", self.object_type)
    }
}

/// Sync word `1111 1111 1111` with layer bits `00`.
pub fn is_header(data: &[u8], offset: usize) -> bool {
    offset + 1 < data.len() && data[offset] == 0xFF && (data[offset + 1] & 0xF6) == 0xF0
}

pub fn parse_header(data: &[u8], offset: usize) -> Option<AdtsHeader> {
    if offset + 7 > data.len() || !is_header(data, offset) {
        return None;
    }
    let d = &data[offset..];
    let protection_absent = d[1] & 0x01 != 0;
    let header_len = if protection_absent { 7 } else { 9 };
    let object_type = ((d[2] & 0xC0) >> 6) + 1;
    let sample_rate_index = (d[2] & 0x3C) >> 2;
    let sample_rate = *SAMPLE_RATES.get(sample_rate_index as usize)?;
    let channels = ((d[2] & 0x01) << 2) | ((d[3] & 0xC0) >> 6);
    let frame_len =
        ((d[3] as usize & 0x03) << 11) | ((d[4] as usize) << 3) | ((d[5] as usize & 0xE0) >> 5);
    if frame_len <= header_len {
        return None;
    }
    Some(AdtsHeader {
        object_type,
        sample_rate_index,
        sample_rate,
        channels,
        header_len,
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

/// Duration of one frame in 90 kHz ticks.
pub fn frame_duration_90k(sample_rate: u32) -> f64 {
    FRAME_SAMPLES as f64 * 90_000.0 / sample_rate as f64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One ADTS frame (AAC-LC, 44.1 kHz, stereo) with `payload_len` bytes of filler.
    pub(crate) fn frame(payload_len: usize, fill: u8) -> Vec<u8> {
        let frame_len = payload_len + 7;
        let mut out = vec![
            0xFF,
            0xF1,
            (1 << 6) | (4 << 2),
            (2 << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ];
        out.extend(std::iter::repeat_n(fill, payload_len));
        out
    }

    #[test]
    fn test_parse_header() {
        let data = frame(20, 0xAA);
        let header = parse_header(&data, 0).unwrap();
        assert_eq!(header.object_type, 2);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.frame_len, 27);
        assert_eq!(header.payload_len(), 20);
        assert_eq!(header.codec(), "mp4a.40.2");
        assert_eq!(&header.audio_specific_config()[..], &[0x12, 0x10]);
    }

    #[test]
    fn test_probe_requires_following_header() {
        let mut data = frame(10, 0);
        assert!(probe(&data, 0));
        data.extend_from_slice(&[0x00, 0x01]);
        assert!(!probe(&data, 0));
        let mut two = frame(10, 0);
        two.extend(frame(12, 0));
        assert!(probe(&two, 0));
    }
}
