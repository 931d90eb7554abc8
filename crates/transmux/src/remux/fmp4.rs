//! Elementary tracks to fragmented MP4.
//!
//! Timestamps are rebased on the session init PTS so the sink timeline starts at
//! the time offset of the first loaded fragment. While the pipeline is
//! contiguous, decode times continue exactly from the previous push.

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use super::boxes::{
    self, AUDIO_TRACK_ID, FragmentSample, SAMPLE_FLAGS_NON_SYNC, SAMPLE_FLAGS_SYNC, TrackSpec,
    VIDEO_TRACK_ID,
};
use super::{
    InitPts, InitTrack, RemuxContext, RemuxResult, RemuxedTrack, StreamType, TimedPayload,
    ticks_to_secs,
};
use crate::demux::{
    AudioCodecKind, AudioConfig, AudioTrack, ElementaryTracks, MPEG_TIMESCALE, TimedSample,
    VideoConfig, VideoTrack,
};

const PTS_WRAP: i64 = 1 << 33;
const DEFAULT_VIDEO_DURATION: i64 = 3000;
/// Largest gap or overlap between pushes that is absorbed by snapping.
const MAX_SNAP: i64 = MPEG_TIMESCALE as i64;

/// Unwrap a 33-bit timestamp to the rollover closest to `reference`.
pub fn normalize_pts(value: i64, reference: Option<i64>) -> i64 {
    let Some(reference) = reference else {
        return value;
    };
    let mut value = value;
    while value - reference > PTS_WRAP / 2 {
        value -= PTS_WRAP;
    }
    while reference - value > PTS_WRAP / 2 {
        value += PTS_WRAP;
    }
    value
}

#[derive(Debug, Default)]
pub struct Fmp4Remuxer {
    init_pts: Option<i64>,
    /// Next expected video decode time, relative to `init_pts`.
    next_video_dts: Option<i64>,
    /// Next expected audio time, relative to `init_pts`.
    next_audio_pts: Option<f64>,
    last_video_duration: Option<i64>,
    audio_init: Option<AudioConfig>,
    video_init: Option<VideoConfig>,
    sequence: u32,
}

impl Fmp4Remuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_pts(&self) -> Option<i64> {
        self.init_pts
    }

    pub fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        debug!(?default_init_pts, "Resetting remux timestamp baseline");
        self.init_pts = default_init_pts;
        self.reset_next_timestamp();
    }

    pub fn reset_next_timestamp(&mut self) {
        self.next_video_dts = None;
        self.next_audio_pts = None;
    }

    pub fn reset_init_segment(&mut self) {
        self.audio_init = None;
        self.video_init = None;
    }

    pub fn remux(&mut self, mut tracks: ElementaryTracks, ctx: &RemuxContext<'_>) -> RemuxResult {
        let mut result = RemuxResult::default();

        if !ctx.contiguous {
            self.reset_next_timestamp();
        }
        if self.next_video_dts.is_none() {
            drop_leading_non_key(&mut tracks.video);
        }

        if self.init_pts.is_none() {
            let first_video = tracks.video.samples.first().map(|s| s.pts);
            let first_audio = tracks.audio.samples.first().map(|s| s.pts);
            if let Some(first) = [first_video, first_audio].into_iter().flatten().min() {
                let init_pts = first - (ctx.time_offset * MPEG_TIMESCALE as f64).round() as i64;
                debug!(init_pts, time_offset = ctx.time_offset, "Established init PTS");
                self.init_pts = Some(init_pts);
                result.init_pts = Some(InitPts {
                    pts: init_pts,
                    timescale: MPEG_TIMESCALE,
                });
            }
        }

        self.generate_init(&tracks, ctx, &mut result);

        if let Some(init_pts) = self.init_pts {
            if self.video_init.is_some() && !tracks.video.samples.is_empty() {
                result.video = self.remux_video(&tracks.video, init_pts);
            }
            if self.audio_init.is_some() && !tracks.audio.samples.is_empty() {
                result.audio = self.remux_audio(&tracks.audio, init_pts);
            }
            result.id3 = timed_payloads(&tracks.id3, init_pts);
            result.text = timed_payloads(&tracks.text, init_pts);
        } else if !tracks.id3.is_empty() || !tracks.text.is_empty() {
            trace!("Dropping timed metadata before init PTS is known");
        }

        result
    }

    fn generate_init(
        &mut self,
        tracks: &ElementaryTracks,
        ctx: &RemuxContext<'_>,
        result: &mut RemuxResult,
    ) {
        if let Some(config) = &tracks.audio.config
            && self.audio_init.as_ref() != Some(config)
        {
            let codec = match (config.kind, ctx.audio_codec) {
                (AudioCodecKind::Aac, Some(hint)) if hint.starts_with("mp4a.") => hint.to_owned(),
                _ => config.codec.clone(),
            };
            let data = boxes::init_segment(&[TrackSpec::Audio {
                timescale: config.sample_rate,
                config,
            }]);
            result.init.push(InitTrack {
                stream_type: StreamType::Audio,
                codec,
                container: if config.kind == AudioCodecKind::Mpeg {
                    "audio/mpeg"
                } else {
                    "audio/mp4"
                },
                data,
            });
            self.audio_init = Some(config.clone());
        }

        if let Some(config) = &tracks.video.config
            && self.video_init.as_ref() != Some(config)
        {
            let data = boxes::init_segment(&[TrackSpec::Video {
                timescale: MPEG_TIMESCALE,
                config,
            }]);
            result.init.push(InitTrack {
                stream_type: StreamType::Video,
                codec: config.codec.clone(),
                container: "video/mp4",
                data,
            });
            self.video_init = Some(config.clone());
        }
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn remux_video(&mut self, track: &VideoTrack, init_pts: i64) -> Option<RemuxedTrack> {
        let mut samples: Vec<(i64, i64, &crate::demux::VideoSample)> = track
            .samples
            .iter()
            .map(|s| {
                let pts = normalize_pts(s.pts, Some(init_pts)) - init_pts;
                let dts = normalize_pts(s.dts, Some(init_pts)) - init_pts;
                (pts, dts, s)
            })
            .collect();
        samples.sort_by_key(|(_, dts, _)| *dts);

        if let (Some(next), Some(first)) = (self.next_video_dts, samples.first_mut()) {
            let delta = first.1 - next;
            if delta != 0 && delta.abs() <= MAX_SNAP {
                if delta > 0 {
                    trace!(delta, "Closing video hole between pushes");
                } else {
                    trace!(delta, "Absorbing video overlap between pushes");
                }
                first.1 = next;
                first.0 = first.0.max(next);
            } else if delta != 0 {
                warn!(delta, "Video timestamps jump between contiguous pushes");
            }
        }

        let first_dts = samples.first()?.1;
        if first_dts < 0 {
            warn!(first_dts, "Negative video decode time clamped to zero");
        }

        let mut fragment_samples = Vec::with_capacity(samples.len());
        let mut payload = BytesMut::with_capacity(samples.iter().map(|s| s.2.avcc_len()).sum());
        let mut min_pts = i64::MAX;
        let mut max_pts_end = i64::MIN;
        let mut last_duration = self.last_video_duration.unwrap_or(DEFAULT_VIDEO_DURATION);

        for i in 0..samples.len() {
            let (pts, dts, sample) = samples[i];
            let duration = match samples.get(i + 1) {
                Some(next) => (next.1 - dts).max(0),
                None => last_duration,
            };
            if duration > 0 {
                last_duration = duration;
            }
            for unit in &sample.units {
                payload.put_u32(unit.len() as u32);
                payload.put_slice(unit);
            }
            fragment_samples.push(FragmentSample {
                duration: duration as u32,
                size: sample.avcc_len() as u32,
                flags: if sample.key {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                },
                composition_offset: (pts - dts) as i32,
            });
            min_pts = min_pts.min(pts);
            max_pts_end = max_pts_end.max(pts + duration);
        }
        self.last_video_duration = Some(last_duration);

        let last_dts = samples.last()?.1;
        let end_dts = last_dts + fragment_samples.last().map_or(0, |s| s.duration as i64);
        self.next_video_dts = Some(end_dts);

        let sequence = self.next_sequence();
        let data = boxes::media_segment(
            sequence,
            VIDEO_TRACK_ID,
            first_dts.max(0) as u64,
            &fragment_samples,
            &payload,
        );
        Some(RemuxedTrack {
            stream_type: StreamType::Video,
            data,
            start_pts: ticks_to_secs(min_pts),
            end_pts: ticks_to_secs(max_pts_end),
            start_dts: ticks_to_secs(first_dts),
            end_dts: ticks_to_secs(end_dts),
            samples: fragment_samples.len(),
            mpeg_audio: false,
        })
    }

    fn remux_audio(&mut self, track: &AudioTrack, init_pts: i64) -> Option<RemuxedTrack> {
        let config = self.audio_init.clone()?;
        let frame_duration =
            config.samples_per_frame as f64 * MPEG_TIMESCALE as f64 / config.sample_rate as f64;

        let mut expected = self.next_audio_pts;
        let mut timed = Vec::with_capacity(track.samples.len());
        for sample in &track.samples {
            let pts = (normalize_pts(sample.pts, Some(init_pts)) - init_pts) as f64;
            let pts = match expected {
                Some(next) if pts < next - frame_duration / 2.0 => {
                    trace!(pts, next, "Dropping overlapping audio frame");
                    continue;
                }
                Some(next) if pts - next < frame_duration / 2.0 => next,
                Some(next) => {
                    debug!(gap = pts - next, "Audio gap between frames");
                    pts
                }
                None => pts,
            };
            expected = Some(pts + frame_duration);
            timed.push((pts, sample));
        }
        let (first_pts, _) = *timed.first()?;
        let last_pts = timed.last().map_or(first_pts, |(pts, _)| *pts);
        let end_pts = last_pts + frame_duration;
        self.next_audio_pts = Some(end_pts);

        let rate = config.sample_rate as f64;
        let to_audio_ticks = |pts: f64| (pts.max(0.0) * rate / MPEG_TIMESCALE as f64).round() as u64;
        let base = to_audio_ticks(first_pts);

        let mut payload = BytesMut::with_capacity(timed.iter().map(|(_, s)| s.data.len()).sum());
        let mut fragment_samples = Vec::with_capacity(timed.len());
        let mut cursor = base;
        for (i, (_, sample)) in timed.iter().enumerate() {
            let next_start = timed
                .get(i + 1)
                .map_or(cursor + config.samples_per_frame as u64, |(pts, _)| {
                    to_audio_ticks(*pts)
                });
            let duration = next_start.saturating_sub(cursor).max(1);
            cursor += duration;
            payload.put_slice(&sample.data);
            fragment_samples.push(FragmentSample {
                duration: duration as u32,
                size: sample.data.len() as u32,
                flags: SAMPLE_FLAGS_SYNC,
                composition_offset: 0,
            });
        }

        let sequence = self.next_sequence();
        let data = boxes::media_segment(
            sequence,
            AUDIO_TRACK_ID,
            base,
            &fragment_samples,
            &payload,
        );
        let start = first_pts / MPEG_TIMESCALE as f64;
        let end = end_pts / MPEG_TIMESCALE as f64;
        Some(RemuxedTrack {
            stream_type: StreamType::Audio,
            data,
            start_pts: start,
            end_pts: end,
            start_dts: start,
            end_dts: end,
            samples: fragment_samples.len(),
            mpeg_audio: config.kind == AudioCodecKind::Mpeg,
        })
    }
}

/// Drop video samples ahead of the first keyframe.
fn drop_leading_non_key(track: &mut VideoTrack) {
    let Some(first_key) = track.samples.iter().position(|s| s.key) else {
        if !track.samples.is_empty() {
            warn!(dropped = track.samples.len(), "No keyframe in video samples, dropping");
            track.samples.clear();
        }
        return;
    };
    if first_key > 0 {
        debug!(dropped = first_key, "Dropping video samples before first keyframe");
        track.samples.drain(..first_key);
    }
}

fn timed_payloads(samples: &[TimedSample], init_pts: i64) -> Vec<TimedPayload> {
    samples
        .iter()
        .map(|s| TimedPayload {
            pts: ticks_to_secs(normalize_pts(s.pts, Some(init_pts)) - init_pts),
            dts: ticks_to_secs(normalize_pts(s.dts, Some(init_pts)) - init_pts),
            data: s.data.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{AudioSample, VideoSample};
    use crate::isobmff;
    use crate::remux::boxes::tests::{audio_config, video_config};
    use bytes::Bytes;

    fn video_sample(dts: i64, key: bool) -> VideoSample {
        VideoSample {
            pts: dts + 3000,
            dts,
            key,
            units: vec![Bytes::from_static(&[0x65, 0x88, 0x84])],
        }
    }

    fn audio_sample(pts: i64) -> AudioSample {
        AudioSample {
            pts,
            dts: pts,
            data: Bytes::from_static(&[0x21, 0x00, 0x49]),
        }
    }

    fn tracks(video: &[(i64, bool)], audio: &[i64]) -> ElementaryTracks {
        let mut tracks = ElementaryTracks::default();
        tracks.video.config = Some(video_config());
        tracks.audio.config = Some(audio_config());
        tracks.video.samples = video.iter().map(|&(d, k)| video_sample(d, k)).collect();
        tracks.audio.samples = audio.iter().map(|&p| audio_sample(p)).collect();
        tracks
    }

    fn ctx(time_offset: f64, contiguous: bool) -> RemuxContext<'static> {
        RemuxContext {
            time_offset,
            contiguous,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_remux_sets_init_pts_and_init_segments() {
        let mut remuxer = Fmp4Remuxer::new();
        let result = remuxer.remux(
            tracks(&[(900_000, true), (903_000, false)], &[900_000, 902_090]),
            &ctx(10.0, false),
        );

        assert_eq!(result.init_pts.unwrap().pts, 0);
        assert_eq!(result.init.len(), 2);
        assert_eq!(result.init[0].stream_type, StreamType::Audio);
        assert_eq!(result.init[1].codec, "avc1.42c01e");

        let video = result.video.unwrap();
        assert_eq!(video.samples, 2);
        assert!((video.start_dts - 10.0).abs() < 1e-9);
        assert!((video.end_dts - (906_000.0 / 90_000.0)).abs() < 1e-9);
        assert!((video.start_pts - (903_000.0 / 90_000.0)).abs() < 1e-9);

        let audio = result.audio.unwrap();
        assert_eq!(audio.samples, 2);
        assert!((audio.start_pts - 10.0).abs() < 1e-9);

        let info = isobmff::parse_init_segment(&result.init[0].data).unwrap();
        let timings = isobmff::fragment_timings(&audio.data, &info);
        assert_eq!(timings[0].base_decode_time, 441_000);
        assert_eq!(timings[0].duration, 2048);
    }

    #[test]
    fn test_second_push_reuses_init_segments() {
        let mut remuxer = Fmp4Remuxer::new();
        remuxer.remux(tracks(&[(0, true)], &[0]), &ctx(0.0, false));
        let second = remuxer.remux(tracks(&[(3000, false)], &[2090]), &ctx(0.0, true));
        assert!(second.init.is_empty());
        assert!(second.init_pts.is_none());
        assert_eq!(second.video.unwrap().samples, 1);
    }

    #[test]
    fn test_leading_non_key_frames_dropped() {
        let mut remuxer = Fmp4Remuxer::new();
        let result = remuxer.remux(
            tracks(&[(0, false), (3000, false), (6000, true), (9000, false)], &[]),
            &ctx(0.0, false),
        );
        let video = result.video.unwrap();
        assert_eq!(video.samples, 2);
        assert_eq!(result.init_pts.unwrap().pts, 9000);
    }

    #[test]
    fn test_contiguous_audio_drops_overlap_and_snaps() {
        let mut remuxer = Fmp4Remuxer::new();
        let first = remuxer.remux(tracks(&[], &[0, 2090]), &ctx(0.0, false));
        let first_audio = first.audio.unwrap();
        let expected_end = 2.0 * 1024.0 / 44_100.0;
        assert!((first_audio.end_pts - expected_end).abs() < 1e-9);

        // 2090 overlaps the previous push; 4190 is 10 ticks late and gets snapped.
        let second = remuxer.remux(tracks(&[], &[2090, 4190, 6269]), &ctx(0.0, true));
        let audio = second.audio.unwrap();
        assert_eq!(audio.samples, 2);
        assert!((audio.start_pts - expected_end).abs() < 1e-9);
    }

    #[test]
    fn test_contiguous_video_closes_small_hole() {
        let mut remuxer = Fmp4Remuxer::new();
        remuxer.remux(tracks(&[(0, true), (3000, false)], &[]), &ctx(0.0, false));
        let second = remuxer.remux(tracks(&[(6100, false)], &[]), &ctx(0.0, true));
        let video = second.video.unwrap();
        assert!((video.start_dts - 6000.0 / 90_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_timestamp_uses_default_init_pts() {
        let mut remuxer = Fmp4Remuxer::new();
        remuxer.reset_timestamp(Some(450_000));
        let result = remuxer.remux(tracks(&[(900_000, true)], &[]), &ctx(0.0, false));
        assert!(result.init_pts.is_none());
        assert!((result.video.unwrap().start_dts - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_pts_rollover() {
        let reference = PTS_WRAP - 90_000;
        assert_eq!(normalize_pts(90_000, Some(reference)), PTS_WRAP + 90_000);
        assert_eq!(normalize_pts(PTS_WRAP - 1, Some(10)), -1);
        assert_eq!(normalize_pts(5, None), 5);
    }
}
