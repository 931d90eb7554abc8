//! Media fragments as listed by a media playlist.

use std::fmt;

use tokio::time::Instant;
use transmux::DecryptParams;

/// Which scheduler a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaylistType {
    /// Variant playlists, carrying video and possibly muxed audio.
    Main,
    /// Alternate audio renditions.
    Audio,
}

impl PlaylistType {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaylistType::Main => "main",
            PlaylistType::Audio => "audio",
        }
    }
}

impl fmt::Display for PlaylistType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementaryStream {
    Audio,
    Video,
}

/// Half-open byte range `[start, end)` within the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of an HTTP `Range` header selecting this range.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// AES-128 encryption descriptor of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub uri: String,
    /// Explicit IV; when absent the sequence number is used.
    pub iv: Option<[u8; 16]>,
    /// Filled in once the key has been loaded.
    pub key: Option<[u8; 16]>,
}

impl EncryptionInfo {
    pub fn new(uri: impl Into<String>, iv: Option<[u8; 16]>) -> Self {
        Self {
            uri: uri.into(),
            iv,
            key: None,
        }
    }

    /// IV for the fragment with sequence number `sn`.
    pub fn iv_for(&self, sn: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| sn_iv(sn))
    }
}

/// Big-endian 128-bit encoding of a media sequence number.
pub fn sn_iv(sn: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sn.to_be_bytes());
    iv
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ElementaryStreamInfo {
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentStats {
    pub loaded: usize,
    pub total: usize,
    pub chunk_count: u32,
    pub loading_start: Option<Instant>,
    pub loading_end: Option<Instant>,
    pub parsing_end: Option<Instant>,
    pub buffering_start: Option<Instant>,
    pub buffering_end: Option<Instant>,
}

/// Identity of a fragment load: the track, the sequence number and the load epoch.
///
/// The epoch is bumped every time a scheduler starts or abandons a load, so
/// completions carrying an older epoch belong to an invalidated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadToken {
    pub kind: PlaylistType,
    pub level: usize,
    pub sn: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub kind: PlaylistType,
    /// Index of the owning track.
    pub level: usize,
    pub sn: u64,
    /// Continuity counter, bumped at every discontinuity.
    pub cc: u32,
    pub start: f64,
    pub duration: f64,
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub decrypt: Option<EncryptionInfo>,
    /// Wall-clock start in epoch milliseconds.
    pub program_date_time: Option<i64>,
    /// True for the `EXT-X-MAP` init segment.
    pub is_init_segment: bool,
    pub audio: Option<ElementaryStreamInfo>,
    pub video: Option<ElementaryStreamInfo>,
    pub start_pts: Option<f64>,
    pub end_pts: Option<f64>,
    pub start_dts: Option<f64>,
    pub end_dts: Option<f64>,
    pub delta_pts: Option<f64>,
    pub stats: FragmentStats,
}

impl Fragment {
    pub fn new(kind: PlaylistType, level: usize, sn: u64, start: f64, duration: f64) -> Self {
        Self {
            kind,
            level,
            sn,
            cc: 0,
            start,
            duration,
            url: String::new(),
            byte_range: None,
            decrypt: None,
            program_date_time: None,
            is_init_segment: false,
            audio: None,
            video: None,
            start_pts: None,
            end_pts: None,
            start_dts: None,
            end_dts: None,
            delta_pts: None,
            stats: FragmentStats::default(),
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn end_program_date_time(&self) -> Option<i64> {
        self.program_date_time
            .map(|pdt| pdt + (self.duration * 1000.0).round() as i64)
    }

    pub fn encrypted(&self) -> bool {
        self.decrypt.is_some()
    }

    /// Encrypted and the key has not been loaded yet.
    pub fn needs_key(&self) -> bool {
        self.decrypt.as_ref().is_some_and(|d| d.key.is_none())
    }

    pub fn decrypt_params(&self) -> Option<DecryptParams> {
        let info = self.decrypt.as_ref()?;
        let key = info.key?;
        Some(DecryptParams::aes128(key, info.iv_for(self.sn)))
    }

    /// Elementary streams known to be present in this fragment.
    pub fn elementary_streams(&self) -> Vec<ElementaryStream> {
        let mut streams = Vec::with_capacity(2);
        if self.audio.is_some() {
            streams.push(ElementaryStream::Audio);
        }
        if self.video.is_some() {
            streams.push(ElementaryStream::Video);
        }
        streams
    }

    /// Record the parsed timing of one elementary stream and widen the
    /// fragment's PTS/DTS bounds. Returns the drift between the playlist start
    /// and the parsed start.
    pub fn set_elementary_stream_info(
        &mut self,
        stream: ElementaryStream,
        info: ElementaryStreamInfo,
    ) -> f64 {
        match stream {
            ElementaryStream::Audio => self.audio = Some(info),
            ElementaryStream::Video => self.video = Some(info),
        }
        let start_pts = self.start_pts.map_or(info.start_pts, |v| v.min(info.start_pts));
        let end_pts = self.end_pts.map_or(info.end_pts, |v| v.max(info.end_pts));
        self.start_pts = Some(start_pts);
        self.end_pts = Some(end_pts);
        self.start_dts = Some(self.start_dts.map_or(info.start_dts, |v| v.min(info.start_dts)));
        self.end_dts = Some(self.end_dts.map_or(info.end_dts, |v| v.max(info.end_dts)));

        let drift = start_pts - self.start;
        self.delta_pts = Some(drift.abs());
        drift
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        if self.is_init_segment {
            format!("init segment of level {}", self.level)
        } else {
            format!("sn {} of level {}", self.sn, self.level)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Five 5 s fragments; the third starts a discontinuity whose wall-clock
    /// time jumps 10 s ahead of the previous fragment's end.
    pub(crate) fn mock_fragments() -> Vec<Fragment> {
        let pdts = [
            1_505_502_661_523i64,
            1_505_502_666_523,
            1_505_502_681_523,
            1_505_502_686_523,
            1_505_502_691_523,
        ];
        pdts.iter()
            .enumerate()
            .map(|(i, &pdt)| {
                let mut frag = Fragment::new(PlaylistType::Main, 2, i as u64, i as f64 * 5.0, 5.0);
                frag.cc = if i < 2 { 0 } else { 1 };
                frag.program_date_time = Some(pdt);
                frag
            })
            .collect()
    }

    #[test]
    fn test_sn_iv() {
        let iv = sn_iv(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn test_byte_range_header() {
        let range = ByteRange { start: 100, end: 200 };
        assert_eq!(range.header_value(), "bytes=100-199");
        assert_eq!(range.len(), 100);
    }

    #[test]
    fn test_elementary_stream_info_widens_bounds() {
        let mut frag = Fragment::new(PlaylistType::Main, 0, 1, 10.0, 5.0);
        frag.set_elementary_stream_info(
            ElementaryStream::Video,
            ElementaryStreamInfo {
                start_pts: 10.1,
                end_pts: 15.0,
                start_dts: 10.0,
                end_dts: 14.9,
            },
        );
        let drift = frag.set_elementary_stream_info(
            ElementaryStream::Audio,
            ElementaryStreamInfo {
                start_pts: 10.05,
                end_pts: 15.1,
                start_dts: 10.05,
                end_dts: 15.1,
            },
        );
        assert!((drift - 0.05).abs() < 1e-9);
        assert_eq!(frag.start_pts, Some(10.05));
        assert_eq!(frag.end_pts, Some(15.1));
        assert_eq!(frag.start_dts, Some(10.0));
        assert_eq!(
            frag.elementary_streams(),
            vec![ElementaryStream::Audio, ElementaryStream::Video]
        );
    }

    #[test]
    fn test_decrypt_params_need_key() {
        let mut frag = Fragment::new(PlaylistType::Main, 0, 7, 0.0, 4.0);
        frag.decrypt = Some(EncryptionInfo::new("https://example.com/key", None));
        assert!(frag.needs_key());
        assert!(frag.decrypt_params().is_none());

        frag.decrypt.as_mut().unwrap().key = Some([1; 16]);
        let params = frag.decrypt_params().unwrap();
        assert_eq!(params.key, [1; 16]);
        assert_eq!(params.iv, sn_iv(7));
    }
}
