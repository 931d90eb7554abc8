//! Playback sink abstraction and an in-memory implementation.
//!
//! A sink owns one buffer per [`StreamType`]. Appends and removes complete
//! asynchronously: the sink reports [`SinkSignal::UpdateEnd`] (or
//! [`SinkSignal::Error`] followed by `UpdateEnd`) on the channel handed to
//! [`PlaybackSink::attach`]. Only one append or remove may be pending per
//! buffer; the buffer queue guarantees that.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use transmux::StreamType;
use transmux::isobmff::{self, InitSegmentInfo};

use crate::buffer_helper::{self, TimeRanges};
use crate::error::SinkError;

/// Asynchronous completion reported by a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkSignal {
    UpdateEnd(StreamType),
    Error { stream: StreamType, error: SinkError },
}

pub trait PlaybackSink: Send {
    /// Hand the sink the channel its completion signals go to.
    fn attach(&mut self, signals: mpsc::UnboundedSender<SinkSignal>);

    fn create_buffer(&mut self, stream: StreamType, mime: &str) -> Result<(), SinkError>;

    fn has_buffer(&self, stream: StreamType) -> bool;

    /// Start appending `data`. A synchronous error means nothing was started.
    fn append(&mut self, stream: StreamType, data: Bytes) -> Result<(), SinkError>;

    /// Start removing `[start, end)`.
    fn remove(&mut self, stream: StreamType, start: f64, end: f64) -> Result<(), SinkError>;

    /// Abort the pending segment parse. Completes synchronously.
    fn abort(&mut self, stream: StreamType) -> Result<(), SinkError>;

    fn is_updating(&self, stream: StreamType) -> bool;

    fn buffered(&self, stream: StreamType) -> TimeRanges;

    fn timestamp_offset(&self, stream: StreamType) -> f64;

    fn set_timestamp_offset(&mut self, stream: StreamType, offset: f64);

    /// Total duration in seconds; NaN until first set.
    fn duration(&self) -> f64;

    fn set_duration(&mut self, duration: f64);

    fn end_of_stream(&mut self);

    /// Playhead position in seconds.
    fn current_time(&self) -> f64;

    fn is_seeking(&self) -> bool;

    /// Move the playhead, e.g. to the start position once media is buffered.
    fn seek(&mut self, position: f64);

    /// Called by the session after every dispatched event. Sinks that
    /// complete work lazily or move the playhead do so here.
    fn poll(&mut self) {}
}

#[derive(Debug, Clone, PartialEq)]
struct StoredSegment {
    start: f64,
    end: f64,
    len: usize,
}

#[derive(Debug, Default)]
struct MemoryBuffer {
    mime: String,
    init: Option<InitSegmentInfo>,
    /// Buffered ranges per track id; the buffer reports their intersection.
    track_ranges: HashMap<u32, TimeRanges>,
    segments: Vec<StoredSegment>,
    bytes: usize,
    updating: bool,
    timestamp_offset: f64,
}

impl MemoryBuffer {
    fn buffered(&self) -> TimeRanges {
        let sets: Vec<&[(f64, f64)]> = self.track_ranges.values().map(Vec::as_slice).collect();
        buffer_helper::intersect(&sets)
    }
}

/// Sink that keeps appended media in memory and derives buffered ranges from
/// the fMP4 timing boxes.
///
/// The playhead only moves through [`MemorySink::seek`] unless realtime
/// playback is enabled, in which case [`PlaybackSink::poll`] advances it with
/// the clock while the position is buffered.
#[derive(Debug)]
pub struct MemorySink {
    buffers: HashMap<StreamType, MemoryBuffer>,
    signals: Option<mpsc::UnboundedSender<SinkSignal>>,
    tap: Option<mpsc::UnboundedSender<(StreamType, Bytes)>>,
    quota: usize,
    duration: f64,
    ended: bool,
    current_time: f64,
    seeking: bool,
    realtime: bool,
    last_poll: Option<Instant>,
}

impl MemorySink {
    /// `quota` bounds the bytes held per buffer.
    pub fn new(quota: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            signals: None,
            tap: None,
            quota,
            duration: f64::NAN,
            ended: false,
            current_time: 0.0,
            seeking: false,
            realtime: false,
            last_poll: None,
        }
    }

    /// Forward every successfully appended segment to `tap`.
    pub fn with_tap(mut self, tap: mpsc::UnboundedSender<(StreamType, Bytes)>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn with_realtime_playback(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn buffered_bytes(&self, stream: StreamType) -> usize {
        self.buffers.get(&stream).map_or(0, |b| b.bytes)
    }

    pub fn mime(&self, stream: StreamType) -> Option<&str> {
        self.buffers.get(&stream).map(|b| b.mime.as_str())
    }

    /// Time buffered by every buffer, as a media element would expose it.
    pub fn media_buffered(&self) -> TimeRanges {
        let ranges: Vec<TimeRanges> = self.buffers.values().map(MemoryBuffer::buffered).collect();
        let sets: Vec<&[(f64, f64)]> = ranges.iter().map(Vec::as_slice).collect();
        buffer_helper::intersect(&sets)
    }

    fn signal(&self, signal: SinkSignal) {
        if let Some(signals) = &self.signals
            && signals.send(signal).is_err()
        {
            debug!("Sink signal receiver dropped");
        }
    }

    fn buffer_mut(&mut self, stream: StreamType) -> Result<&mut MemoryBuffer, SinkError> {
        self.buffers
            .get_mut(&stream)
            .ok_or(SinkError::MissingBuffer { stream })
    }
}

impl PlaybackSink for MemorySink {
    fn attach(&mut self, signals: mpsc::UnboundedSender<SinkSignal>) {
        self.signals = Some(signals);
    }

    fn create_buffer(&mut self, stream: StreamType, mime: &str) -> Result<(), SinkError> {
        debug!(%stream, mime, "Creating sink buffer");
        let buffer = self.buffers.entry(stream).or_default();
        buffer.mime = mime.to_string();
        Ok(())
    }

    fn has_buffer(&self, stream: StreamType) -> bool {
        self.buffers.contains_key(&stream)
    }

    fn append(&mut self, stream: StreamType, data: Bytes) -> Result<(), SinkError> {
        let quota = self.quota;
        let buffer = self.buffer_mut(stream)?;
        if buffer.updating {
            return Err(SinkError::Append {
                stream,
                reason: "buffer is updating".to_string(),
            });
        }
        if buffer.bytes + data.len() > quota {
            return Err(SinkError::QuotaExceeded { stream });
        }

        if let Some(init) = isobmff::parse_init_segment(&data) {
            trace!(%stream, tracks = init.tracks.len(), "Init segment appended");
            for track in &init.tracks {
                buffer.track_ranges.entry(track.id).or_default();
            }
            buffer.init = Some(init);
        } else {
            let Some(init) = &buffer.init else {
                return Err(SinkError::Append {
                    stream,
                    reason: "media segment before init segment".to_string(),
                });
            };
            let timings = isobmff::fragment_timings(&data, init);
            let mut start = f64::INFINITY;
            let mut end = f64::NEG_INFINITY;
            for timing in timings {
                let Some(track) = init.track(timing.track_id) else {
                    continue;
                };
                let timescale = track.timescale.max(1) as f64;
                let s = buffer.timestamp_offset + timing.base_decode_time as f64 / timescale;
                let e = s + timing.duration as f64 / timescale;
                buffer_helper::insert_range(
                    buffer.track_ranges.entry(timing.track_id).or_default(),
                    s,
                    e,
                );
                start = start.min(s);
                end = end.max(e);
            }
            if start.is_finite() {
                buffer.segments.push(StoredSegment {
                    start,
                    end,
                    len: data.len(),
                });
            }
        }
        buffer.bytes += data.len();
        buffer.updating = true;

        if let Some(tap) = &self.tap
            && tap.send((stream, data)).is_err()
        {
            warn!(%stream, "Sink tap closed");
            self.tap = None;
        }
        Ok(())
    }

    fn remove(&mut self, stream: StreamType, start: f64, end: f64) -> Result<(), SinkError> {
        let buffer = self.buffer_mut(stream)?;
        if buffer.updating {
            return Err(SinkError::Remove {
                stream,
                reason: "buffer is updating".to_string(),
            });
        }
        for ranges in buffer.track_ranges.values_mut() {
            buffer_helper::remove_range(ranges, start, end);
        }
        let mut freed = 0;
        buffer.segments.retain(|segment| {
            let covered = segment.start >= start && segment.end <= end;
            if covered {
                freed += segment.len;
            }
            !covered
        });
        buffer.bytes = buffer.bytes.saturating_sub(freed);
        buffer.updating = true;
        trace!(%stream, start, end, freed, "Removed buffered range");
        Ok(())
    }

    fn abort(&mut self, stream: StreamType) -> Result<(), SinkError> {
        let buffer = self.buffer_mut(stream)?;
        buffer.updating = false;
        Ok(())
    }

    fn is_updating(&self, stream: StreamType) -> bool {
        self.buffers.get(&stream).is_some_and(|b| b.updating)
    }

    fn buffered(&self, stream: StreamType) -> TimeRanges {
        self.buffers
            .get(&stream)
            .map(MemoryBuffer::buffered)
            .unwrap_or_default()
    }

    fn timestamp_offset(&self, stream: StreamType) -> f64 {
        self.buffers.get(&stream).map_or(0.0, |b| b.timestamp_offset)
    }

    fn set_timestamp_offset(&mut self, stream: StreamType, offset: f64) {
        if let Some(buffer) = self.buffers.get_mut(&stream) {
            buffer.timestamp_offset = offset;
        }
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_duration(&mut self, duration: f64) {
        self.duration = duration;
    }

    fn end_of_stream(&mut self) {
        debug!("Sink reached end of stream");
        self.ended = true;
    }

    fn current_time(&self) -> f64 {
        self.current_time
    }

    fn is_seeking(&self) -> bool {
        self.seeking
    }

    fn seek(&mut self, position: f64) {
        self.current_time = position;
        self.seeking = true;
    }

    fn poll(&mut self) {
        let completed: Vec<StreamType> = self
            .buffers
            .iter_mut()
            .filter(|(_, buffer)| buffer.updating)
            .map(|(stream, buffer)| {
                buffer.updating = false;
                *stream
            })
            .collect();
        for stream in completed {
            self.signal(SinkSignal::UpdateEnd(stream));
        }

        let now = Instant::now();
        let elapsed = self
            .last_poll
            .replace(now)
            .map_or(0.0, |last| now.duration_since(last).as_secs_f64());
        if self.buffers.is_empty() {
            return;
        }
        let media = self.media_buffered();
        if self.seeking && buffer_helper::is_buffered(&media, self.current_time) {
            self.seeking = false;
        }
        if !self.realtime || self.seeking {
            return;
        }
        if let Some(&(_, end)) = media
            .iter()
            .find(|&&(s, e)| self.current_time >= s - 0.5 && self.current_time < e)
        {
            self.current_time = (self.current_time + elapsed).min(end);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use transmux::demux::{AudioCodecKind, AudioConfig};
    use transmux::remux::boxes::{self, AUDIO_TRACK_ID, FragmentSample, SAMPLE_FLAGS_SYNC, TrackSpec};

    const TIMESCALE: u32 = 1000;

    /// Single-track AAC init segment with a millisecond timescale.
    pub(crate) fn audio_init() -> Bytes {
        let config = AudioConfig {
            kind: AudioCodecKind::Aac,
            codec: "mp4a.40.2".to_owned(),
            sample_rate: 44_100,
            channels: 2,
            specific_config: Bytes::from_static(&[0x12, 0x10]),
            samples_per_frame: 1024,
        };
        boxes::init_segment(&[TrackSpec::Audio {
            timescale: TIMESCALE,
            config: &config,
        }])
    }

    /// Media segment covering `[start, start + duration)` seconds.
    pub(crate) fn audio_segment(start: f64, duration: f64) -> Bytes {
        let samples = [FragmentSample {
            duration: (duration * TIMESCALE as f64).round() as u32,
            size: 4,
            flags: SAMPLE_FLAGS_SYNC,
            composition_offset: 0,
        }];
        boxes::media_segment(
            1,
            AUDIO_TRACK_ID,
            (start * TIMESCALE as f64).round() as u64,
            &samples,
            &[0, 1, 2, 3],
        )
    }

    fn sink_with_audio(quota: usize) -> (MemorySink, mpsc::UnboundedReceiver<SinkSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = MemorySink::new(quota);
        sink.attach(tx);
        sink.create_buffer(StreamType::Audio, "audio/mp4;codecs=mp4a.40.2")
            .unwrap();
        (sink, rx)
    }

    #[test]
    fn test_append_tracks_buffered_ranges() {
        let (mut sink, mut rx) = sink_with_audio(1 << 20);
        sink.append(StreamType::Audio, audio_init()).unwrap();
        assert!(sink.is_updating(StreamType::Audio));
        assert!(rx.try_recv().is_err());
        sink.poll();
        assert!(!sink.is_updating(StreamType::Audio));
        assert_eq!(rx.try_recv().unwrap(), SinkSignal::UpdateEnd(StreamType::Audio));

        sink.append(StreamType::Audio, audio_segment(0.0, 4.0)).unwrap();
        sink.poll();
        sink.append(StreamType::Audio, audio_segment(4.0, 4.0)).unwrap();
        assert_eq!(sink.buffered(StreamType::Audio), vec![(0.0, 8.0)]);
        assert_eq!(sink.media_buffered(), vec![(0.0, 8.0)]);
    }

    #[test]
    fn test_append_while_updating_fails() {
        let (mut sink, _rx) = sink_with_audio(1 << 20);
        sink.append(StreamType::Audio, audio_init()).unwrap();
        let err = sink.append(StreamType::Audio, audio_segment(0.0, 4.0)).unwrap_err();
        assert!(matches!(err, SinkError::Append { .. }));
    }

    #[test]
    fn test_media_before_init_fails() {
        let (mut sink, _rx) = sink_with_audio(1 << 20);
        let err = sink.append(StreamType::Audio, audio_segment(0.0, 4.0)).unwrap_err();
        assert!(matches!(err, SinkError::Append { .. }));
        assert!(!sink.is_updating(StreamType::Audio));
    }

    #[test]
    fn test_quota_and_eviction() {
        let init = audio_init();
        let segment_len = audio_segment(0.0, 4.0).len();
        let (mut sink, _rx) = sink_with_audio(init.len() + 2 * segment_len);
        sink.append(StreamType::Audio, init).unwrap();
        sink.poll();
        sink.append(StreamType::Audio, audio_segment(0.0, 4.0)).unwrap();
        sink.poll();
        sink.append(StreamType::Audio, audio_segment(4.0, 4.0)).unwrap();
        sink.poll();
        let err = sink.append(StreamType::Audio, audio_segment(8.0, 4.0)).unwrap_err();
        assert!(err.is_quota_exceeded());

        sink.remove(StreamType::Audio, 0.0, 4.0).unwrap();
        sink.poll();
        assert_eq!(sink.buffered(StreamType::Audio), vec![(4.0, 8.0)]);
        sink.append(StreamType::Audio, audio_segment(8.0, 4.0)).unwrap();
        assert_eq!(sink.buffered(StreamType::Audio), vec![(4.0, 12.0)]);
    }

    #[test]
    fn test_tap_receives_appends() {
        let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = MemorySink::new(1 << 20).with_tap(tap_tx);
        sink.attach(tx);
        sink.create_buffer(StreamType::Audio, "audio/mp4").unwrap();
        let init = audio_init();
        sink.append(StreamType::Audio, init.clone()).unwrap();
        assert_eq!(tap_rx.try_recv().unwrap(), (StreamType::Audio, init));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_playhead_stops_at_buffer_end() {
        let (sink, _rx) = sink_with_audio(1 << 20);
        let mut sink = sink.with_realtime_playback(true);
        sink.append(StreamType::Audio, audio_init()).unwrap();
        sink.poll();
        sink.append(StreamType::Audio, audio_segment(0.0, 2.0)).unwrap();
        sink.poll();

        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        sink.poll();
        assert!((sink.current_time() - 1.5).abs() < 1e-6);

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        sink.poll();
        assert_eq!(sink.current_time(), 2.0);
    }
}
