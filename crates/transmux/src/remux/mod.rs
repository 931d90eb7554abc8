//! Remuxers: elementary tracks or fMP4 fragments in, sink-appendable segments out.

pub mod boxes;
pub mod fmp4;
pub mod passthrough;

use std::fmt;

use bytes::Bytes;

use crate::demux::{DemuxResult, MPEG_TIMESCALE};
pub use fmp4::Fmp4Remuxer;
pub use passthrough::PassthroughRemuxer;

/// Sink buffer a segment is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    Audio,
    Video,
    AudioVideo,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Audio, StreamType::Video, StreamType::AudioVideo];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::AudioVideo => "audiovideo",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Init segment for one sink buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    pub stream_type: StreamType,
    pub codec: String,
    pub container: &'static str,
    pub data: Bytes,
}

/// One `moof`+`mdat` run with its time bounds in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RemuxedTrack {
    pub stream_type: StreamType,
    pub data: Bytes,
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
    pub samples: usize,
    /// MPEG audio relies on the sink's timestamp offset rather than `tfdt`.
    pub mpeg_audio: bool,
}

/// Timed metadata or caption payload, times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedPayload {
    pub pts: f64,
    pub dts: f64,
    pub data: Bytes,
}

/// Session timestamp baseline, in 90 kHz ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitPts {
    pub pts: i64,
    pub timescale: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemuxResult {
    pub init: Vec<InitTrack>,
    pub audio: Option<RemuxedTrack>,
    pub video: Option<RemuxedTrack>,
    pub id3: Vec<TimedPayload>,
    pub text: Vec<TimedPayload>,
    /// Set when this call established a new baseline.
    pub init_pts: Option<InitPts>,
}

impl RemuxResult {
    pub fn is_empty(&self) -> bool {
        self.init.is_empty()
            && self.audio.is_none()
            && self.video.is_none()
            && self.id3.is_empty()
            && self.text.is_empty()
            && self.init_pts.is_none()
    }
}

/// Per-load inputs the remuxer needs besides the demuxed data.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemuxContext<'a> {
    pub time_offset: f64,
    pub contiguous: bool,
    pub accurate_time_offset: bool,
    pub init_segment: Option<&'a Bytes>,
    pub audio_codec: Option<&'a str>,
    pub video_codec: Option<&'a str>,
}

#[derive(Debug)]
pub enum Remuxer {
    Fragmented(Fmp4Remuxer),
    Passthrough(PassthroughRemuxer),
}

impl Remuxer {
    pub fn remux(&mut self, demuxed: DemuxResult, ctx: &RemuxContext<'_>) -> RemuxResult {
        match (self, demuxed) {
            (Remuxer::Fragmented(r), DemuxResult::Elementary(tracks)) => r.remux(tracks, ctx),
            (Remuxer::Passthrough(r), DemuxResult::Fragmented(chunk)) => r.remux(chunk, ctx),
            (remuxer, demuxed) => {
                tracing::warn!(?remuxer, empty = demuxed.is_empty(), "Demuxer output does not match remuxer");
                RemuxResult::default()
            }
        }
    }

    pub fn reset_init_segment(&mut self) {
        match self {
            Remuxer::Fragmented(r) => r.reset_init_segment(),
            Remuxer::Passthrough(r) => r.reset_init_segment(),
        }
    }

    pub fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        match self {
            Remuxer::Fragmented(r) => r.reset_timestamp(default_init_pts),
            Remuxer::Passthrough(r) => r.reset_timestamp(default_init_pts),
        }
    }

    pub fn reset_next_timestamp(&mut self) {
        match self {
            Remuxer::Fragmented(r) => r.reset_next_timestamp(),
            Remuxer::Passthrough(_) => {}
        }
    }
}

pub(crate) fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / MPEG_TIMESCALE as f64
}
