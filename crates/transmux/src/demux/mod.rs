//! Container demuxers.
//!
//! Every demuxer turns pushed bytes into elementary track buffers, except the MP4
//! demuxer which hands fragmented MP4 through untouched. Timestamps are 90 kHz.

pub mod adts;
pub mod audio;
pub mod avc;
pub mod id3;
pub mod mp4;
pub mod mpeg_audio;
pub mod ts;

use bytes::Bytes;

pub use audio::RawAudioDemuxer;
pub use mp4::Mp4Demuxer;
pub use ts::TsDemuxer;

/// MPEG-2 system clock rate used by all elementary timestamps.
pub const MPEG_TIMESCALE: u32 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodecKind {
    #[default]
    Aac,
    Mpeg,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioConfig {
    pub kind: AudioCodecKind,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// AudioSpecificConfig for AAC; empty for MPEG audio.
    pub specific_config: Bytes,
    pub samples_per_frame: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSample {
    pub pts: i64,
    pub dts: i64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct AudioTrack {
    pub config: Option<AudioConfig>,
    pub samples: Vec<AudioSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub sps: Bytes,
    pub pps: Bytes,
}

/// One access unit; NAL units carry no start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSample {
    pub pts: i64,
    pub dts: i64,
    pub key: bool,
    pub units: Vec<Bytes>,
}

impl VideoSample {
    /// Size once written with four-byte length prefixes.
    pub fn avcc_len(&self) -> usize {
        self.units.iter().map(|u| u.len() + 4).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VideoTrack {
    pub config: Option<VideoConfig>,
    pub samples: Vec<VideoSample>,
}

/// Timed metadata (ID3) or caption user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedSample {
    pub pts: i64,
    pub dts: i64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ElementaryTracks {
    pub audio: AudioTrack,
    pub video: VideoTrack,
    pub id3: Vec<TimedSample>,
    pub text: Vec<TimedSample>,
}

impl ElementaryTracks {
    pub fn is_empty(&self) -> bool {
        self.audio.samples.is_empty()
            && self.video.samples.is_empty()
            && self.id3.is_empty()
            && self.text.is_empty()
    }
}

/// Fragmented MP4 bytes passed through as-is.
#[derive(Debug, Clone, Default)]
pub struct FragmentedChunk {
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum DemuxResult {
    Elementary(ElementaryTracks),
    Fragmented(FragmentedChunk),
}

impl DemuxResult {
    pub fn is_empty(&self) -> bool {
        match self {
            DemuxResult::Elementary(tracks) => tracks.is_empty(),
            DemuxResult::Fragmented(chunk) => chunk.data.is_empty(),
        }
    }
}

/// Supported containers, in probing priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerKind {
    Ts,
    Mp4,
    Aac,
    Mp3,
}

impl DemuxerKind {
    pub const PRIORITY: [DemuxerKind; 4] = [
        DemuxerKind::Ts,
        DemuxerKind::Mp4,
        DemuxerKind::Aac,
        DemuxerKind::Mp3,
    ];

    /// Bytes needed before this container can be identified.
    pub const fn min_probe_len(self) -> usize {
        match self {
            DemuxerKind::Ts => ts::MIN_PROBE_LEN,
            DemuxerKind::Mp4 => mp4::MIN_PROBE_LEN,
            DemuxerKind::Aac => audio::AAC_MIN_PROBE_LEN,
            DemuxerKind::Mp3 => audio::MP3_MIN_PROBE_LEN,
        }
    }

    pub fn probe(self, data: &[u8]) -> bool {
        match self {
            DemuxerKind::Ts => ts::probe(data),
            DemuxerKind::Mp4 => mp4::probe(data),
            DemuxerKind::Aac => audio::probe(AudioCodecKind::Aac, data),
            DemuxerKind::Mp3 => audio::probe(AudioCodecKind::Mpeg, data),
        }
    }

    pub fn create(self) -> Demuxer {
        match self {
            DemuxerKind::Ts => Demuxer::Ts(TsDemuxer::new()),
            DemuxerKind::Mp4 => Demuxer::Mp4(Mp4Demuxer::new()),
            DemuxerKind::Aac => Demuxer::Aac(RawAudioDemuxer::new(AudioCodecKind::Aac)),
            DemuxerKind::Mp3 => Demuxer::Mp3(RawAudioDemuxer::new(AudioCodecKind::Mpeg)),
        }
    }
}

#[derive(Debug)]
pub enum Demuxer {
    Ts(TsDemuxer),
    Mp4(Mp4Demuxer),
    Aac(RawAudioDemuxer),
    Mp3(RawAudioDemuxer),
}

impl Demuxer {
    pub fn kind(&self) -> DemuxerKind {
        match self {
            Demuxer::Ts(_) => DemuxerKind::Ts,
            Demuxer::Mp4(_) => DemuxerKind::Mp4,
            Demuxer::Aac(_) => DemuxerKind::Aac,
            Demuxer::Mp3(_) => DemuxerKind::Mp3,
        }
    }

    pub fn demux(&mut self, data: Bytes, time_offset: f64) -> DemuxResult {
        match self {
            Demuxer::Ts(d) => DemuxResult::Elementary(d.demux(data)),
            Demuxer::Mp4(d) => DemuxResult::Fragmented(d.demux(data)),
            Demuxer::Aac(d) | Demuxer::Mp3(d) => DemuxResult::Elementary(d.demux(data, time_offset)),
        }
    }

    /// Emit whatever partial access units are still buffered.
    pub fn flush(&mut self) -> DemuxResult {
        match self {
            Demuxer::Ts(d) => DemuxResult::Elementary(d.flush()),
            Demuxer::Mp4(d) => DemuxResult::Fragmented(d.flush()),
            Demuxer::Aac(d) | Demuxer::Mp3(d) => DemuxResult::Elementary(d.flush()),
        }
    }

    pub fn reset_init_segment(&mut self, audio_codec: Option<&str>, video_codec: Option<&str>) {
        match self {
            Demuxer::Ts(d) => d.reset_init_segment(audio_codec, video_codec),
            Demuxer::Mp4(d) => d.reset_init_segment(),
            Demuxer::Aac(d) | Demuxer::Mp3(d) => d.reset_init_segment(),
        }
    }

    pub fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        match self {
            Demuxer::Ts(_) | Demuxer::Mp4(_) => {}
            Demuxer::Aac(d) | Demuxer::Mp3(d) => d.reset_timestamp(default_init_pts),
        }
    }

    pub fn reset_contiguity(&mut self) {
        match self {
            Demuxer::Ts(d) => d.reset_contiguity(),
            Demuxer::Mp4(d) => d.reset_contiguity(),
            Demuxer::Aac(d) | Demuxer::Mp3(d) => d.reset_contiguity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_chunk_matches_nothing() {
        let smallest = DemuxerKind::PRIORITY
            .iter()
            .map(|k| k.min_probe_len())
            .min()
            .unwrap();
        let data = vec![0xFFu8; smallest - 1];
        assert!(DemuxerKind::PRIORITY.iter().all(|k| !k.probe(&data)));
    }
}
