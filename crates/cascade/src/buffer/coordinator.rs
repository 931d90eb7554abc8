//! Drives the sink through the operation queue.
//!
//! Schedulers announce codecs, segments to append, ranges to flush and parsed
//! fragments; the coordinator turns those into queued sink operations and
//! reports the outcome as [`CoordinatorEvent`]s for the session to route.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use transmux::{ChunkMetadata, StreamType};

use super::queue::{BufferOperation, Execution, OperationHandler, OperationQueue};
use crate::buffer_helper::{self, TimeRanges};
use crate::config::BufferConfig;
use crate::error::{ErrorDetails, ErrorEvent, SinkError};
use crate::fragment::{Fragment, LoadToken, PlaylistType};
use crate::sink::{PlaybackSink, SinkSignal};
use crate::track::TrackDetails;

/// Minimum shift before an MPEG audio timestamp offset is moved.
const TIMESTAMP_OFFSET_TOLERANCE: f64 = 0.1;

/// Codec announcement for one sink buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferTrack {
    pub stream: StreamType,
    pub codec: String,
    pub container: String,
}

impl BufferTrack {
    pub fn mime(&self) -> String {
        format!("{};codecs={}", self.container, self.codec)
    }
}

/// Buffered state as seen from the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaSnapshot {
    pub current_time: f64,
    pub seeking: bool,
    pub buffered: HashMap<StreamType, TimeRanges>,
    /// Time buffered by every sink buffer.
    pub media: TimeRanges,
}

impl MediaSnapshot {
    pub fn ranges(&self, stream: StreamType) -> &[(f64, f64)] {
        self.buffered.get(&stream).map_or(&[], Vec::as_slice)
    }

    pub fn has_buffer(&self, stream: StreamType) -> bool {
        self.buffered.contains_key(&stream)
    }
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    BuffersCreated {
        tracks: Vec<BufferTrack>,
    },
    Appended {
        stream: StreamType,
        parent: PlaylistType,
        frag: Option<LoadToken>,
        chunk_meta: Option<ChunkMetadata>,
        buffered: TimeRanges,
    },
    Flushed {
        stream: StreamType,
    },
    FragBuffered {
        frag: Box<Fragment>,
        token: LoadToken,
        buffered: Vec<(StreamType, TimeRanges)>,
    },
    /// The sink was told the stream has ended.
    Ended,
    Error(ErrorEvent),
}

/// Action run once every barrier of a group has been reached.
#[derive(Debug)]
enum BarrierAction {
    FragBuffered(Box<Fragment>, LoadToken),
    EndOfStream,
    UpdateDuration,
}

#[derive(Debug)]
struct PendingBarrier {
    streams: Vec<StreamType>,
    action: BarrierAction,
}

#[derive(Debug, Clone, Copy)]
struct LevelInfo {
    live: bool,
    target_duration: f64,
    duration: f64,
}

pub struct BufferCoordinator<S: PlaybackSink> {
    sink: S,
    config: BufferConfig,
    queue: OperationQueue,
    tracks: BTreeMap<StreamType, BufferTrack>,
    pending_tracks: BTreeMap<StreamType, BufferTrack>,
    codec_events_expected: usize,
    append_errors: u32,
    ended: HashSet<StreamType>,
    level: Option<LevelInfo>,
    barriers: HashMap<u64, PendingBarrier>,
    next_barrier: u64,
    barrier_tx: mpsc::UnboundedSender<u64>,
    outbox: Vec<CoordinatorEvent>,
}

/// Borrow of the coordinator state the queue callbacks touch.
struct Executor<'a, S: PlaybackSink> {
    sink: &'a mut S,
    append_errors: &'a mut u32,
    max_append_errors: u32,
    outbox: &'a mut Vec<CoordinatorEvent>,
}

impl<S: PlaybackSink> OperationHandler for Executor<'_, S> {
    fn has_buffer(&self, stream: StreamType) -> bool {
        self.sink.has_buffer(stream)
    }

    fn is_updating(&self, stream: StreamType) -> bool {
        self.sink.is_updating(stream)
    }

    fn execute(
        &mut self,
        stream: StreamType,
        operation: &mut BufferOperation,
    ) -> Result<Execution, SinkError> {
        match operation {
            BufferOperation::Append { data, .. } => {
                trace!(%stream, bytes = data.len(), "Appending to sink");
                self.sink.append(stream, data.clone())?;
                Ok(Execution::Pending)
            }
            BufferOperation::Remove { start, end } => {
                let duration = self.sink.duration();
                let start = start.max(0.0);
                let end = if duration.is_nan() { *end } else { end.min(duration) };
                if end > start {
                    debug!(%stream, start, end, "Removing buffered range");
                    self.sink.remove(stream, start, end)?;
                    Ok(Execution::Pending)
                } else {
                    Ok(Execution::Skipped)
                }
            }
            BufferOperation::Abort { .. } => {
                self.sink.abort(stream)?;
                Ok(Execution::Completed)
            }
            BufferOperation::Barrier { release } => {
                if let Some(tx) = release.take()
                    && tx.send(()).is_err()
                {
                    trace!(%stream, "Barrier waiter dropped");
                }
                Ok(Execution::Blocked)
            }
        }
    }

    fn on_complete(&mut self, stream: StreamType, operation: BufferOperation) {
        match operation {
            BufferOperation::Append {
                parent,
                frag,
                chunk_meta,
                ..
            } => {
                *self.append_errors = 0;
                self.outbox.push(CoordinatorEvent::Appended {
                    stream,
                    parent,
                    frag,
                    chunk_meta,
                    buffered: self.sink.buffered(stream),
                });
            }
            BufferOperation::Remove { .. } => {
                self.outbox.push(CoordinatorEvent::Flushed { stream });
            }
            BufferOperation::Abort { timestamp_offset } => {
                if let Some(offset) = timestamp_offset {
                    debug!(%stream, offset, "Updating timestamp offset");
                    self.sink.set_timestamp_offset(stream, offset);
                }
            }
            BufferOperation::Barrier { .. } => {}
        }
    }

    fn on_error(&mut self, stream: StreamType, operation: &BufferOperation, err: SinkError) {
        match operation {
            BufferOperation::Append { parent, .. } => {
                let event = if err.is_quota_exceeded() {
                    ErrorEvent::new(ErrorDetails::BufferFullError, false, err.to_string())
                } else {
                    *self.append_errors += 1;
                    let fatal = *self.append_errors > self.max_append_errors;
                    if fatal {
                        error!(
                            %stream,
                            errors = *self.append_errors,
                            "Append error budget exhausted"
                        );
                    }
                    ErrorEvent::new(ErrorDetails::BufferAppendError, fatal, err.to_string())
                };
                self.outbox
                    .push(CoordinatorEvent::Error(event.with_parent(*parent)));
            }
            BufferOperation::Remove { start, end } => {
                warn!(%stream, start, end, error = %err, "Failed to remove buffered range");
            }
            BufferOperation::Abort { .. } => {
                warn!(%stream, error = %err, "Failed to abort sink buffer");
            }
            BufferOperation::Barrier { .. } => {}
        }
    }
}

impl<S: PlaybackSink> BufferCoordinator<S> {
    /// `barrier_tx` receives the id of every barrier group whose waits have
    /// resolved; feed it back through [`Self::on_barrier_released`].
    pub fn new(sink: S, config: BufferConfig, barrier_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            sink,
            config,
            queue: OperationQueue::new(),
            tracks: BTreeMap::new(),
            pending_tracks: BTreeMap::new(),
            codec_events_expected: 1,
            append_errors: 0,
            ended: HashSet::new(),
            level: None,
            barriers: HashMap::new(),
            next_barrier: 0,
            barrier_tx,
            outbox: Vec::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn tracks(&self) -> impl Iterator<Item = &BufferTrack> {
        self.tracks.values()
    }

    pub fn drain_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn split(&mut self) -> (&mut OperationQueue, Executor<'_, S>) {
        (
            &mut self.queue,
            Executor {
                sink: &mut self.sink,
                append_errors: &mut self.append_errors,
                max_append_errors: self.config.append_error_max_retry,
                outbox: &mut self.outbox,
            },
        )
    }

    fn stream_types(&self) -> Vec<StreamType> {
        StreamType::ALL
            .into_iter()
            .filter(|t| self.sink.has_buffer(*t))
            .collect()
    }

    pub fn snapshot(&self) -> MediaSnapshot {
        let buffered: HashMap<StreamType, TimeRanges> = self
            .stream_types()
            .into_iter()
            .map(|t| (t, self.sink.buffered(t)))
            .collect();
        let sets: Vec<&[(f64, f64)]> = buffered.values().map(Vec::as_slice).collect();
        MediaSnapshot {
            current_time: self.sink.current_time(),
            seeking: self.sink.is_seeking(),
            media: buffer_helper::intersect(&sets),
            buffered,
        }
    }

    /// Number of codec announcements to wait for before creating buffers.
    pub fn on_manifest_parsed(&mut self, alt_audio: bool) {
        self.codec_events_expected = if alt_audio { 2 } else { 1 };
        debug!(expected = self.codec_events_expected, "Waiting for codec announcements");
    }

    pub fn on_buffer_codecs(&mut self, tracks: Vec<BufferTrack>) {
        if !self.tracks.is_empty() {
            for track in tracks {
                if !self.tracks.contains_key(&track.stream) {
                    warn!(stream = %track.stream, "Codec announced after buffers were created");
                } else if self.tracks.get(&track.stream) != Some(&track) {
                    debug!(stream = %track.stream, codec = %track.codec, "Codec changed");
                    self.tracks.insert(track.stream, track);
                }
            }
            return;
        }

        for track in tracks {
            self.pending_tracks.insert(track.stream, track);
        }
        self.codec_events_expected = self.codec_events_expected.saturating_sub(1);
        let pending = self.pending_tracks.len();
        if (pending > 0 && self.codec_events_expected == 0) || pending == 2 {
            self.create_buffers();
        }
    }

    fn create_buffers(&mut self) {
        let pending = std::mem::take(&mut self.pending_tracks);
        let mut created = Vec::with_capacity(pending.len());
        for (stream, track) in pending {
            let mime = track.mime();
            match self.sink.create_buffer(stream, &mime) {
                Ok(()) => {
                    info!(%stream, mime, "Created sink buffer");
                    self.tracks.insert(stream, track.clone());
                    created.push(track);
                }
                Err(err) => {
                    error!(%stream, mime, error = %err, "Failed to create sink buffer");
                    self.outbox.push(CoordinatorEvent::Error(ErrorEvent::new(
                        ErrorDetails::InternalException,
                        true,
                        format!("failed to create {stream} buffer: {err}"),
                    )));
                }
            }
        }
        if created.is_empty() {
            return;
        }
        self.outbox
            .push(CoordinatorEvent::BuffersCreated { tracks: created });
        for stream in self.stream_types() {
            let (queue, mut executor) = self.split();
            queue.execute_next(stream, &mut executor);
        }
    }

    pub fn on_buffer_appending(
        &mut self,
        stream: StreamType,
        data: Bytes,
        parent: PlaylistType,
        frag: Option<LoadToken>,
        chunk_meta: Option<ChunkMetadata>,
    ) {
        // Fresh appends mean the buffer is no longer at its end.
        self.ended.remove(&stream);
        let operation = BufferOperation::Append {
            data,
            parent,
            frag,
            chunk_meta,
        };
        let (queue, mut executor) = self.split();
        queue.append(stream, operation, &mut executor);
    }

    /// Queue removal of `[start, end)` from `stream`, or from every buffer.
    pub fn on_buffer_flushing(&mut self, stream: Option<StreamType>, start: f64, end: f64) {
        let streams = match stream {
            Some(stream) => vec![stream],
            None => self.stream_types(),
        };
        for stream in streams {
            let (queue, mut executor) = self.split();
            queue.append(stream, BufferOperation::Remove { start, end }, &mut executor);
        }
    }

    /// Wait for the appends of `frag` to settle, then report it buffered.
    pub fn on_frag_parsed(&mut self, frag: Fragment, token: LoadToken, streams: &[StreamType]) {
        self.block_buffers(streams, BarrierAction::FragBuffered(Box::new(frag), token));
    }

    /// Mark `stream` (or every buffer) ended; signal end of stream once all have.
    pub fn on_buffer_eos(&mut self, stream: Option<StreamType>) {
        let streams = self.stream_types();
        for t in &streams {
            if stream.is_none_or(|s| s == *t) {
                self.ended.insert(*t);
            }
        }
        if !streams.is_empty() && streams.iter().all(|t| self.ended.contains(t)) {
            debug!("All buffers ended, queueing end of stream");
            self.block_buffers(&streams, BarrierAction::EndOfStream);
        }
    }

    pub fn on_level_updated(&mut self, details: &TrackDetails) {
        if details.fragments.is_empty() {
            return;
        }
        self.level = Some(LevelInfo {
            live: details.live,
            target_duration: details.target_duration,
            duration: details.level_duration(),
        });
        let streams = self.stream_types();
        if streams.is_empty() {
            self.update_duration();
        } else {
            self.block_buffers(&streams, BarrierAction::UpdateDuration);
        }
    }

    /// Move the MPEG audio timestamp offset to a fragment's parsed start.
    pub fn on_level_pts_updated(&mut self, stream: StreamType, start: f64) {
        let is_mpeg = self
            .tracks
            .get(&stream)
            .is_some_and(|t| t.container == "audio/mpeg");
        if stream != StreamType::Audio || !is_mpeg {
            return;
        }
        let delta = (self.sink.timestamp_offset(stream) - start).abs();
        if delta >= TIMESTAMP_OFFSET_TOLERANCE {
            debug!(%stream, start, delta, "Queueing timestamp offset update");
            let (queue, mut executor) = self.split();
            queue.append(
                stream,
                BufferOperation::Abort {
                    timestamp_offset: Some(start),
                },
                &mut executor,
            );
        }
    }

    pub fn on_sink_signal(&mut self, signal: SinkSignal) {
        match signal {
            SinkSignal::UpdateEnd(stream) => {
                let (queue, mut executor) = self.split();
                queue.on_update_end(stream, &mut executor);
            }
            SinkSignal::Error { stream, error } => {
                warn!(%stream, %error, "Sink buffer error");
                self.outbox.push(CoordinatorEvent::Error(ErrorEvent::new(
                    ErrorDetails::BufferAppendingError,
                    false,
                    error.to_string(),
                )));
                let (queue, mut executor) = self.split();
                queue.on_update_error(stream, error, &mut executor);
            }
        }
    }

    fn block_buffers(&mut self, streams: &[StreamType], action: BarrierAction) {
        let id = self.next_barrier;
        self.next_barrier += 1;
        let streams: Vec<StreamType> = streams
            .iter()
            .copied()
            .filter(|t| self.sink.has_buffer(*t))
            .collect();
        let mut waits = Vec::with_capacity(streams.len());
        for stream in &streams {
            let (queue, mut executor) = self.split();
            waits.push(queue.append_blocker(*stream, &mut executor));
        }
        self.barriers.insert(id, PendingBarrier { streams, action });

        let tx = self.barrier_tx.clone();
        tokio::spawn(async move {
            // A dropped sender means the queue was torn down; release anyway.
            join_all(waits).await;
            if tx.send(id).is_err() {
                trace!(id, "Barrier listener gone");
            }
        });
    }

    /// Run the action of barrier group `id` and resume the blocked queues.
    pub fn on_barrier_released(&mut self, id: u64) {
        let Some(barrier) = self.barriers.remove(&id) else {
            return;
        };
        match barrier.action {
            BarrierAction::FragBuffered(mut frag, token) => {
                frag.stats.buffering_end = Some(Instant::now());
                let buffered = self
                    .stream_types()
                    .into_iter()
                    .map(|t| (t, self.sink.buffered(t)))
                    .collect();
                trace!(frag = %frag.label(), "Fragment buffered");
                self.outbox
                    .push(CoordinatorEvent::FragBuffered {
                        frag,
                        token,
                        buffered,
                    });
                self.flush_live_back_buffer();
            }
            BarrierAction::EndOfStream => {
                let streams = self.stream_types();
                if streams.iter().all(|t| self.ended.contains(t)) {
                    info!("Signalling end of stream");
                    self.sink.end_of_stream();
                    self.outbox.push(CoordinatorEvent::Ended);
                }
            }
            BarrierAction::UpdateDuration => self.update_duration(),
        }

        for stream in barrier.streams {
            let blocked = matches!(
                self.queue.current(stream),
                Some(BufferOperation::Barrier { .. })
            );
            if blocked && !self.sink.is_updating(stream) {
                let (queue, mut executor) = self.split();
                queue.shift_and_execute_next(stream, &mut executor);
            }
        }
    }

    fn update_duration(&mut self) {
        let Some(level) = self.level else {
            return;
        };
        let current = self.sink.duration();
        if level.live && self.config.live_duration_infinity {
            if current != f64::INFINITY {
                debug!("Setting live duration to infinity");
                self.sink.set_duration(f64::INFINITY);
            }
            return;
        }
        if current.is_nan() || level.duration > current {
            debug!(from = current, to = level.duration, "Updating sink duration");
            self.sink.set_duration(level.duration);
        }
    }

    /// Evict live content further behind the playhead than the configured back buffer.
    pub fn flush_live_back_buffer(&mut self) {
        let Some(back_buffer) = self.config.live_back_buffer_length else {
            return;
        };
        let Some(level) = self.level.filter(|l| l.live) else {
            return;
        };
        if !back_buffer.is_finite() || back_buffer < 0.0 {
            return;
        }
        let target = self.sink.current_time() - back_buffer.max(level.target_duration);
        for stream in self.stream_types() {
            let buffered = self.sink.buffered(stream);
            if let Some(&(first_start, _)) = buffered.first()
                && target > first_start
            {
                debug!(%stream, target, "Flushing live back buffer");
                let (queue, mut executor) = self.split();
                queue.append(
                    stream,
                    BufferOperation::Remove {
                        start: 0.0,
                        end: target,
                    },
                    &mut executor,
                );
            }
        }
    }
}
