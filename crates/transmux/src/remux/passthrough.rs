//! Fragmented MP4 passthrough.
//!
//! Media fragments are forwarded with their `tfdt` rebased on the session init
//! PTS. Track layout and timescales come from the configured init segment, or
//! from the first `moov` found in the stream.

use bytes::Bytes;
use tracing::{debug, warn};

use super::{InitPts, InitTrack, RemuxContext, RemuxResult, RemuxedTrack, StreamType};
use crate::demux::{FragmentedChunk, MPEG_TIMESCALE};
use crate::isobmff::{self, InitSegmentInfo, TrackKind};

#[derive(Debug, Default)]
pub struct PassthroughRemuxer {
    init: Option<InitSegmentInfo>,
    init_data: Option<Bytes>,
    init_emitted: bool,
    init_pts: Option<i64>,
}

impl PassthroughRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_init_segment(&mut self) {
        self.init = None;
        self.init_data = None;
        self.init_emitted = false;
    }

    pub fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        self.init_pts = default_init_pts;
    }

    fn stream_type(init: &InitSegmentInfo) -> StreamType {
        let audio = init.first_of(TrackKind::Audio).is_some();
        let video = init.first_of(TrackKind::Video).is_some();
        match (audio, video) {
            (true, true) => StreamType::AudioVideo,
            (true, false) => StreamType::Audio,
            _ => StreamType::Video,
        }
    }

    /// Adopt an init segment, from the config or from the head of `data`.
    ///
    /// Returns the media bytes that follow an in-band init segment.
    fn bind_init(&mut self, data: Bytes, ctx: &RemuxContext<'_>) -> Bytes {
        if let Some(moov) = isobmff::find_first_box(&data, 0, data.len(), *b"moov") {
            let init_data = data.slice(..moov.end);
            if let Some(info) = isobmff::parse_init_segment(&init_data) {
                debug!(tracks = info.tracks.len(), "Using in-band init segment");
                self.init = Some(info);
                self.init_data = Some(init_data);
                self.init_emitted = false;
            }
            return data.slice(moov.end..);
        }
        if self.init.is_none()
            && let Some(init_data) = ctx.init_segment
        {
            match isobmff::parse_init_segment(init_data) {
                Some(info) => {
                    self.init = Some(info);
                    self.init_data = Some(init_data.clone());
                }
                None => warn!(bytes = init_data.len(), "Init segment has no moov box"),
            }
        }
        data
    }

    pub fn remux(&mut self, chunk: FragmentedChunk, ctx: &RemuxContext<'_>) -> RemuxResult {
        let mut result = RemuxResult::default();
        let data = self.bind_init(chunk.data, ctx);

        let (Some(init), Some(init_data)) = (self.init.as_ref(), self.init_data.as_ref()) else {
            if !data.is_empty() {
                warn!(bytes = data.len(), "Dropping fMP4 data without init segment");
            }
            return result;
        };
        let stream_type = Self::stream_type(init);

        if !self.init_emitted {
            let codecs: Vec<&str> = [TrackKind::Audio, TrackKind::Video]
                .into_iter()
                .filter_map(|kind| init.first_of(kind))
                .map(|track| {
                    let hint = match track.kind {
                        TrackKind::Audio => ctx.audio_codec,
                        _ => ctx.video_codec,
                    };
                    hint.unwrap_or(track.codec.as_str())
                })
                .collect();
            result.init.push(InitTrack {
                stream_type,
                codec: codecs.join(","),
                container: if stream_type == StreamType::Audio {
                    "audio/mp4"
                } else {
                    "video/mp4"
                },
                data: init_data.clone(),
            });
            self.init_emitted = true;
        }

        let timings = isobmff::fragment_timings(&data, init);
        if timings.is_empty() {
            return result;
        }
        let mut start = f64::INFINITY;
        let mut end = f64::NEG_INFINITY;
        for timing in &timings {
            let Some(track) = init.track(timing.track_id) else {
                continue;
            };
            let scale = track.timescale.max(1) as f64;
            start = start.min(timing.base_decode_time as f64 / scale);
            end = end.max((timing.base_decode_time + timing.duration) as f64 / scale);
        }
        if !start.is_finite() {
            return result;
        }

        let init_pts = match self.init_pts {
            Some(init_pts) => init_pts,
            None => {
                let init_pts = ((start - ctx.time_offset) * MPEG_TIMESCALE as f64).round() as i64;
                debug!(init_pts, start, "Established init PTS from tfdt");
                self.init_pts = Some(init_pts);
                result.init_pts = Some(InitPts {
                    pts: init_pts,
                    timescale: MPEG_TIMESCALE,
                });
                init_pts
            }
        };

        let mut rebased = data.to_vec();
        isobmff::rebase_decode_times(&mut rebased, init, init_pts);
        let shift = init_pts as f64 / MPEG_TIMESCALE as f64;
        let track = RemuxedTrack {
            stream_type,
            data: Bytes::from(rebased),
            start_pts: start - shift,
            end_pts: end - shift,
            start_dts: start - shift,
            end_dts: end - shift,
            samples: timings.len(),
            mpeg_audio: false,
        };
        if stream_type == StreamType::Audio {
            result.audio = Some(track);
        } else {
            result.video = Some(track);
        }
        result
    }
}
