//! Raw audio elementary streams: ADTS AAC and MPEG audio.
//!
//! Packed audio segments carry no container timestamps. The base time comes from
//! a leading ID3 tag holding the transport-stream timestamp, or from the time
//! offset supplied by the caller.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::{AudioCodecKind, AudioConfig, AudioSample, AudioTrack, ElementaryTracks, TimedSample};
use super::{MPEG_TIMESCALE, adts, id3, mpeg_audio};

pub const AAC_MIN_PROBE_LEN: usize = 9;
pub const MP3_MIN_PROBE_LEN: usize = 4;

/// Whether `data` looks like a raw stream of `kind`, allowing leading ID3 tags.
pub fn probe(kind: AudioCodecKind, data: &[u8]) -> bool {
    let start = id3::tag_len(data, 0).unwrap_or(0);
    if start >= data.len() {
        return false;
    }
    match kind {
        AudioCodecKind::Aac => {
            // MPEG audio frames also satisfy a loose ADTS scan.
            if mpeg_audio::probe(data, start) {
                return false;
            }
            (start..data.len()).any(|offset| adts::probe(data, offset))
        }
        AudioCodecKind::Mpeg => (start..data.len()).any(|offset| mpeg_audio::probe(data, offset)),
    }
}

/// Frames found in one contiguous run of audio bytes.
#[derive(Debug, Default)]
pub(crate) struct FrameScan {
    pub samples: Vec<AudioSample>,
    pub config: Option<AudioConfig>,
    /// Trailing bytes of a frame that continues in the next payload.
    pub leftover: Option<Bytes>,
    /// Duration of one frame in 90 kHz ticks.
    pub frame_duration: f64,
}

struct Frame {
    config: AudioConfig,
    frame_len: usize,
    /// Byte range of the sample data within the frame.
    data_start: usize,
}

fn parse_frame(kind: AudioCodecKind, data: &[u8], offset: usize) -> Option<Frame> {
    match kind {
        AudioCodecKind::Aac => {
            let header = adts::parse_header(data, offset)?;
            Some(Frame {
                config: AudioConfig {
                    kind,
                    codec: header.codec(),
                    sample_rate: header.sample_rate,
                    channels: header.channels,
                    specific_config: header.audio_specific_config(),
                    samples_per_frame: adts::FRAME_SAMPLES,
                },
                frame_len: header.frame_len,
                data_start: header.header_len,
            })
        }
        AudioCodecKind::Mpeg => {
            let header = mpeg_audio::parse_header(data, offset)?;
            Some(Frame {
                config: AudioConfig {
                    kind,
                    codec: "mp3".to_owned(),
                    sample_rate: header.sample_rate,
                    channels: header.channels,
                    specific_config: Bytes::new(),
                    samples_per_frame: header.samples_per_frame,
                },
                frame_len: header.frame_len,
                data_start: 0,
            })
        }
    }
}

fn is_frame_start(kind: AudioCodecKind, data: &[u8], offset: usize) -> bool {
    match kind {
        AudioCodecKind::Aac => adts::is_header(data, offset),
        AudioCodecKind::Mpeg => mpeg_audio::is_header(data, offset),
    }
}

fn min_header_len(kind: AudioCodecKind) -> usize {
    match kind {
        AudioCodecKind::Aac => 7,
        AudioCodecKind::Mpeg => mpeg_audio::HEADER_LEN,
    }
}

/// Split a PES payload into frames timed from `pts`.
///
/// When `continues_frame` is set the first frame began in the previous payload and
/// is timed one frame before `pts`.
pub(crate) fn scan_frames(
    kind: AudioCodecKind,
    data: &Bytes,
    pts: i64,
    continues_frame: bool,
) -> FrameScan {
    let mut scan = FrameScan::default();
    let mut offset = 0;
    let mut index: i64 = if continues_frame { -1 } else { 0 };

    while offset < data.len() {
        if !is_frame_start(kind, data, offset) {
            offset += 1;
            continue;
        }
        if data.len() - offset < min_header_len(kind) {
            scan.leftover = Some(data.slice(offset..));
            break;
        }
        let Some(frame) = parse_frame(kind, data, offset) else {
            offset += 1;
            continue;
        };
        if offset + frame.frame_len > data.len() {
            scan.leftover = Some(data.slice(offset..));
            break;
        }

        let duration = frame.config.samples_per_frame as f64 * MPEG_TIMESCALE as f64
            / frame.config.sample_rate as f64;
        scan.frame_duration = duration;
        let sample_pts = pts + (index as f64 * duration).round() as i64;
        scan.samples.push(AudioSample {
            pts: sample_pts,
            dts: sample_pts,
            data: data.slice(offset + frame.data_start..offset + frame.frame_len),
        });
        if scan.config.is_none() {
            scan.config = Some(frame.config);
        }
        index += 1;
        offset += frame.frame_len;
    }
    scan
}

#[derive(Debug)]
pub struct RawAudioDemuxer {
    kind: AudioCodecKind,
    cache: Option<Bytes>,
    base_pts: Option<i64>,
    frame_index: u64,
    frame_duration: f64,
    default_init_pts: Option<i64>,
    config: Option<AudioConfig>,
}

impl RawAudioDemuxer {
    pub fn new(kind: AudioCodecKind) -> Self {
        Self {
            kind,
            cache: None,
            base_pts: None,
            frame_index: 0,
            frame_duration: 0.0,
            default_init_pts: None,
            config: None,
        }
    }

    fn current_pts(&self, base: i64) -> i64 {
        base + (self.frame_index as f64 * self.frame_duration).round() as i64
    }

    pub fn demux(&mut self, data: Bytes, time_offset: f64) -> ElementaryTracks {
        let buf = match self.cache.take() {
            Some(cached) => {
                let mut joined = BytesMut::with_capacity(cached.len() + data.len());
                joined.extend_from_slice(&cached);
                joined.extend_from_slice(&data);
                joined.freeze()
            }
            None => data,
        };

        let mut out = ElementaryTracks::default();
        let mut offset = 0;

        while offset < buf.len() {
            if id3::is_header(&buf, offset) {
                let Some(len) = id3::tag_len(&buf, offset).filter(|l| offset + l <= buf.len())
                else {
                    break;
                };
                let tag = buf.slice(offset..offset + len);
                if self.base_pts.is_none()
                    && let Some(ts) = id3::transport_stream_timestamp(&tag)
                {
                    debug!(pts = ts, "Audio base time from ID3 timestamp");
                    self.base_pts = Some(ts);
                }
                let base = self.resolve_base(time_offset);
                let pts = self.current_pts(base);
                out.id3.push(TimedSample {
                    pts,
                    dts: pts,
                    data: tag,
                });
                offset += len;
                continue;
            }

            if !is_frame_start(self.kind, &buf, offset) {
                // A partial ID3 header may straddle the chunk boundary.
                if buf.len() - offset < 10 && buf[offset] == b'I' {
                    break;
                }
                offset += 1;
                continue;
            }
            if buf.len() - offset < min_header_len(self.kind) {
                break;
            }
            let Some(frame) = parse_frame(self.kind, &buf, offset) else {
                offset += 1;
                continue;
            };
            if offset + frame.frame_len > buf.len() {
                break;
            }

            self.frame_duration = frame.config.samples_per_frame as f64
                * MPEG_TIMESCALE as f64
                / frame.config.sample_rate as f64;
            if self.config.as_ref() != Some(&frame.config) {
                debug!(codec = %frame.config.codec, rate = frame.config.sample_rate, "Audio track configured");
                self.config = Some(frame.config.clone());
            }
            let base = self.resolve_base(time_offset);
            let pts = self.current_pts(base);
            out.audio.samples.push(AudioSample {
                pts,
                dts: pts,
                data: buf.slice(offset + frame.data_start..offset + frame.frame_len),
            });
            self.frame_index += 1;
            offset += frame.frame_len;
        }

        if offset < buf.len() {
            trace!(bytes = buf.len() - offset, "Caching partial audio frame");
            self.cache = Some(buf.slice(offset..));
        }
        out.audio.config = self.config.clone();
        out
    }

    fn resolve_base(&mut self, time_offset: f64) -> i64 {
        let fallback = self.default_init_pts;
        *self.base_pts.get_or_insert_with(|| {
            fallback.unwrap_or_else(|| (time_offset * MPEG_TIMESCALE as f64).round() as i64)
        })
    }

    pub fn flush(&mut self) -> ElementaryTracks {
        if let Some(cached) = self.cache.take() {
            warn!(bytes = cached.len(), "Dropping incomplete audio frame on flush");
        }
        ElementaryTracks {
            audio: AudioTrack {
                config: self.config.clone(),
                samples: Vec::new(),
            },
            ..Default::default()
        }
    }

    pub fn reset_init_segment(&mut self) {
        self.config = None;
    }

    pub fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        self.default_init_pts = default_init_pts;
        self.base_pts = None;
        self.frame_index = 0;
    }

    pub fn reset_contiguity(&mut self) {
        self.cache = None;
        self.base_pts = None;
        self.frame_index = 0;
    }
}
