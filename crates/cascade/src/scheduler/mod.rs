//! Per-playlist fragment scheduler.
//!
//! A [`Scheduler`] decides which fragment of its track to load next and walks
//! it through key loading, transmuxing and buffering, recovering from load
//! and sink failures on the way. It performs no I/O: every side effect is
//! queued as a [`SchedulerCommand`] for the session to carry out, and the
//! outcome is fed back through the `on_*` methods. Completions are correlated
//! with the current [`LoadToken`], so anything belonging to an abandoned load
//! is dropped.

mod state;

pub use state::SchedulerState;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use transmux::{
    ChunkMetadata, DecryptParams, RemuxedTrack, StreamType, TransmuxConfig, TransmuxError,
    TransmuxResult, TransmuxState,
};

use crate::buffer::{BufferTrack, MediaSnapshot};
use crate::buffer_helper::{self, TimeRanges};
use crate::config::{BackpressureProbe, CascadeConfig};
use crate::error::{ErrorDetails, ErrorEvent, LoadError};
use crate::events::PlayerEvent;
use crate::fragment::{
    ElementaryStream, ElementaryStreamInfo, Fragment, FragmentStats, LoadToken, PlaylistType,
};
use crate::fragment_finder::{find_fragment_by_pdt, find_fragment_by_pts};
use crate::fragment_tracker::{FragmentState, FragmentTracker};
use crate::retry::RetryPolicy;
use crate::track::{Track, TrackDetails, merge_details};

/// Floor of the buffering target when it shrinks under sink backpressure.
const MIN_BUFFER_TARGET: f64 = 1.0;
/// How far past the playhead must be buffered for backpressure to only shrink the target.
const BACKPRESSURE_LOOKAHEAD: f64 = 0.5;

/// Side effect requested by a scheduler.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Fetch or refresh the media playlist of a track.
    LoadTrack { level: usize },
    LoadKey {
        frag: Box<Fragment>,
        token: LoadToken,
    },
    LoadFragment {
        frag: Box<Fragment>,
        token: LoadToken,
        /// Deliver chunks as they arrive instead of once on completion.
        progressive: bool,
    },
    /// Drop the in-flight key or fragment request.
    AbortLoad,
    /// Replace the transmuxer, discarding its demux and remux state.
    ResetTransmuxer,
    ConfigureTransmux {
        config: TransmuxConfig,
        state: TransmuxState,
    },
    TransmuxPush {
        data: Bytes,
        decrypt: Option<DecryptParams>,
        chunk_meta: ChunkMetadata,
    },
    TransmuxFlush {
        chunk_meta: ChunkMetadata,
    },
    BufferCodecs(Vec<BufferTrack>),
    BufferAppending {
        stream: StreamType,
        data: Bytes,
        token: LoadToken,
        chunk_meta: ChunkMetadata,
    },
    /// `None` flushes every buffer.
    BufferFlushing {
        stream: Option<StreamType>,
        start: f64,
        end: f64,
    },
    BufferEos(Option<StreamType>),
    FragParsed {
        frag: Box<Fragment>,
        token: LoadToken,
        streams: Vec<StreamType>,
    },
    LevelUpdated(Box<TrackDetails>),
    LevelPtsUpdated {
        stream: StreamType,
        start: f64,
    },
    /// Timestamp baseline of a continuity counter, in 90 kHz ticks.
    InitPtsFound {
        cc: u32,
        init_pts: i64,
    },
    /// Move the playhead.
    Seek(f64),
    Error(ErrorEvent),
    Event(PlayerEvent),
}

/// Last fragment handed to the transmuxer: `(level, sn, cc)`.
type TransmuxCursor = (usize, u64, u32);

pub struct Scheduler {
    kind: PlaylistType,
    config: Arc<CascadeConfig>,
    state: SchedulerState,
    tracks: Vec<Track>,
    level: Option<usize>,
    /// Main scheduler only: audio is rendered from a separate rendition.
    alt_audio: bool,
    tracker: FragmentTracker,
    frag_current: Option<Fragment>,
    frag_previous: Option<Fragment>,
    token: Option<LoadToken>,
    epoch: u64,
    chunk_id: u32,
    appended: BTreeSet<StreamType>,
    /// Requested start, `None` for the default (zero, or the live sync point).
    start_position: Option<f64>,
    /// Start actually used once track details were known.
    resolved_start: f64,
    next_load_position: f64,
    start_frag_requested: bool,
    /// Media has been buffered, so the playhead drives selection.
    loaded_metadata: bool,
    buffer_target: f64,
    retry: RetryPolicy,
    load_errors: u32,
    retry_at: Option<Instant>,
    init_pts: HashMap<u32, i64>,
    track_switching: bool,
    transmux_cursor: Option<TransmuxCursor>,
    transmux_config: Option<TransmuxConfig>,
    outbox: Vec<SchedulerCommand>,
}

impl Scheduler {
    pub fn new(kind: PlaylistType, config: Arc<CascadeConfig>) -> Self {
        let retry = RetryPolicy::from(&config.fragment);
        let buffer_target = config.max_buffer_target();
        Self {
            kind,
            config,
            state: SchedulerState::Stopped,
            tracks: Vec::new(),
            level: None,
            alt_audio: false,
            tracker: FragmentTracker::new(),
            frag_current: None,
            frag_previous: None,
            token: None,
            epoch: 0,
            chunk_id: 0,
            appended: BTreeSet::new(),
            start_position: None,
            resolved_start: 0.0,
            next_load_position: 0.0,
            start_frag_requested: false,
            loaded_metadata: false,
            buffer_target,
            retry,
            load_errors: 0,
            retry_at: None,
            init_pts: HashMap::new(),
            track_switching: false,
            transmux_cursor: None,
            transmux_config: None,
            outbox: Vec::new(),
        }
    }

    pub fn kind(&self) -> PlaylistType {
        self.kind
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn level(&self) -> Option<usize> {
        self.level
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Details of the current track, if loaded.
    pub fn details(&self) -> Option<&TrackDetails> {
        self.tracks.get(self.level?)?.details.as_ref()
    }

    /// Seconds to buffer ahead, after any backpressure reduction.
    pub fn buffer_target(&self) -> f64 {
        self.buffer_target
    }

    pub fn frag_current(&self) -> Option<&Fragment> {
        self.frag_current.as_ref()
    }

    pub fn frag_previous(&self) -> Option<&Fragment> {
        self.frag_previous.as_ref()
    }

    pub fn current_token(&self) -> Option<LoadToken> {
        self.token
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn drain_commands(&mut self) -> Vec<SchedulerCommand> {
        std::mem::take(&mut self.outbox)
    }

    fn set_state(&mut self, next: SchedulerState) {
        if self.state != next {
            trace!(kind = %self.kind, from = %self.state, to = %next, "Scheduler state change");
            self.state = next;
        }
    }

    fn emit(&mut self, event: PlayerEvent) {
        self.outbox.push(SchedulerCommand::Event(event));
    }

    /// Sink buffer this scheduler appends to, `None` meaning all of them.
    fn own_stream(&self) -> Option<StreamType> {
        match self.kind {
            PlaylistType::Audio => Some(StreamType::Audio),
            PlaylistType::Main if self.alt_audio => Some(StreamType::Video),
            PlaylistType::Main => None,
        }
    }

    fn own_ranges<'a>(&self, media: &'a MediaSnapshot) -> &'a [(f64, f64)] {
        match self.own_stream() {
            Some(stream) if media.has_buffer(stream) => media.ranges(stream),
            Some(_) | None => &media.media,
        }
    }

    fn owns_stream(&self, stream: StreamType) -> bool {
        match self.kind {
            PlaylistType::Audio => stream == StreamType::Audio,
            PlaylistType::Main => stream != StreamType::Audio || !self.alt_audio,
        }
    }

    fn load_position(&self, media: &MediaSnapshot) -> f64 {
        if self.loaded_metadata {
            media.current_time
        } else {
            self.next_load_position
        }
    }

    /// Install the tracks from the manifest. `alt_audio` tells the main
    /// scheduler that audio is played from a separate rendition.
    pub fn set_tracks(&mut self, tracks: Vec<Track>, alt_audio: bool) {
        debug!(kind = %self.kind, count = tracks.len(), alt_audio, "Tracks set");
        self.tracks = tracks;
        self.alt_audio = alt_audio && self.kind == PlaylistType::Main;
        self.level = None;
        self.tracker.clear();
    }

    pub fn start_load(&mut self, start_position: Option<f64>) {
        self.start_position = start_position.or(self.config.fragment.start_position);
        self.start_frag_requested = false;
        self.loaded_metadata = false;
        self.load_errors = 0;
        self.retry_at = None;
        self.buffer_target = self.config.max_buffer_target();
        info!(kind = %self.kind, start = ?self.start_position, "Starting load");
        if self.level.is_none() {
            self.set_state(SchedulerState::Starting);
            return;
        }
        self.resume_on_track();
    }

    pub fn stop_load(&mut self) {
        self.abort_load();
        self.frag_current = None;
        self.set_state(SchedulerState::Stopped);
    }

    /// Stop scheduling new loads until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if matches!(self.state, SchedulerState::Stopped | SchedulerState::Error) {
            return;
        }
        self.abort_load();
        self.frag_current = None;
        self.set_state(SchedulerState::Paused);
    }

    pub fn resume(&mut self) {
        if self.state == SchedulerState::Paused {
            self.resume_on_track();
        }
    }

    /// Idle if the current track has details, otherwise request them.
    fn resume_on_track(&mut self) {
        let Some(level) = self.level else {
            return;
        };
        if self.details().is_some() {
            if !self.start_frag_requested {
                self.resolve_start_position();
            }
            self.set_state(SchedulerState::Idle);
        } else {
            self.set_state(SchedulerState::WaitingTrack);
            self.outbox.push(SchedulerCommand::LoadTrack { level });
        }
    }

    fn resolve_start_position(&mut self) {
        let sync_count = self.config.fragment.live_sync_duration_count;
        let Some(details) = self.details() else {
            return;
        };
        let start = match self.start_position {
            Some(start) => start,
            None if details.live => details.live_sync_position(sync_count),
            None => 0.0,
        };
        self.resolved_start = start;
        self.next_load_position = start;
    }

    /// Make `level` the current track. Any in-flight load is abandoned and
    /// the transmuxer starts over; fragments of the new track are loaded even
    /// if the tracker considers them buffered.
    pub fn switch_track(&mut self, level: usize) {
        if level >= self.tracks.len() {
            warn!(kind = %self.kind, level, "Ignoring switch to unknown track");
            return;
        }
        if self.level == Some(level) {
            return;
        }
        let previous = self.level.replace(level);
        info!(kind = %self.kind, from = ?previous, to = level, "Switching track");
        if previous.is_some() {
            self.abort_load();
            self.frag_current = None;
            self.track_switching = true;
            self.transmux_cursor = None;
            self.transmux_config = None;
            self.outbox.push(SchedulerCommand::ResetTransmuxer);
            if !self.loaded_metadata {
                self.next_load_position = self.resolved_start;
            }
        }
        match self.state {
            SchedulerState::Stopped | SchedulerState::Paused | SchedulerState::Error => {
                if self.details().is_none() {
                    self.outbox.push(SchedulerCommand::LoadTrack { level });
                }
            }
            _ => self.resume_on_track(),
        }
    }

    pub fn on_track_loaded(&mut self, level: usize, mut details: TrackDetails) {
        let Some(track) = self.tracks.get_mut(level) else {
            warn!(kind = %self.kind, level, "Details for unknown track");
            return;
        };
        let mut sliding = 0.0;
        if let Some(old) = track.details.as_ref() {
            if details.live {
                sliding = merge_details(old, &mut details);
            }
            if let (Some(old_init), Some(new_init)) =
                (old.init_segment.as_ref(), details.init_segment.as_mut())
                && old_init.fragment.url == new_init.fragment.url
                && new_init.data.is_none()
            {
                new_init.data = old_init.data.clone();
            }
        }
        debug!(
            kind = %self.kind,
            level,
            live = details.live,
            fragments = details.fragments.len(),
            sliding,
            "Track details loaded"
        );
        let event = PlayerEvent::TrackLoaded {
            kind: self.kind,
            level,
            live: details.live,
            fragments: details.fragments.len(),
            sliding,
        };
        if self.kind == PlaylistType::Main && self.level == Some(level) {
            self.outbox
                .push(SchedulerCommand::LevelUpdated(Box::new(details.clone())));
        }
        track.details = Some(details);
        self.emit(event);

        if self.level != Some(level) {
            return;
        }
        if !self.start_frag_requested {
            self.resolve_start_position();
        }
        if self.state == SchedulerState::WaitingTrack {
            self.set_state(SchedulerState::Idle);
        }
    }

    /// The main timeline established the baseline of continuity counter `cc`.
    pub fn on_init_pts_found(&mut self, cc: u32, init_pts: i64) {
        trace!(kind = %self.kind, cc, init_pts, "Init PTS received");
        self.init_pts.insert(cc, init_pts);
    }

    /// Periodic evaluation against the current buffer state.
    pub fn tick(&mut self, media: &MediaSnapshot) {
        if media.seeking {
            self.on_seeking(media);
        }
        match self.state {
            SchedulerState::WaitingTrack if self.details().is_some() => {
                self.set_state(SchedulerState::Idle);
            }
            SchedulerState::FragLoadingWaitingRetry => {
                let elapsed = self.retry_at.is_none_or(|at| Instant::now() >= at);
                if elapsed || media.seeking {
                    self.retry_at = None;
                    self.set_state(SchedulerState::Idle);
                }
            }
            SchedulerState::WaitingInitPts => {
                let ready = self
                    .frag_current
                    .as_ref()
                    .is_some_and(|frag| self.init_pts.contains_key(&frag.cc));
                if ready {
                    self.set_state(SchedulerState::Idle);
                }
            }
            _ => {}
        }
        if self.state == SchedulerState::Idle {
            self.do_tick_idle(media);
        }
    }

    fn on_seeking(&mut self, media: &MediaSnapshot) {
        let pos = media.current_time;
        let info = buffer_helper::buffer_info(
            self.own_ranges(media),
            pos,
            self.config.buffer.max_buffer_hole,
        );
        if info.len > 0.0 {
            return;
        }
        if self.state == SchedulerState::Ended {
            debug!(kind = %self.kind, pos, "Seeking out of the ended buffer");
            self.reset_loading_state();
        } else if let Some(frag) = &self.frag_current {
            let tolerance = self.config.fragment.max_frag_lookup_tolerance;
            let outside = pos < frag.start - tolerance || pos > frag.end() + tolerance;
            let loading = self.state.is_busy()
                || matches!(
                    self.state,
                    SchedulerState::FragLoadingWaitingRetry | SchedulerState::WaitingInitPts
                );
            if outside && loading {
                debug!(kind = %self.kind, frag = %frag.label(), pos, "Seek left the loading fragment");
                self.reset_loading_state();
            }
        }
        if !self.loaded_metadata {
            self.next_load_position = pos;
            self.resolved_start = pos;
        }
    }

    fn do_tick_idle(&mut self, media: &MediaSnapshot) {
        let Some(level) = self.level else {
            return;
        };
        if self.details().is_none() {
            self.set_state(SchedulerState::WaitingTrack);
            self.outbox.push(SchedulerCommand::LoadTrack { level });
            return;
        }

        let hole = self.config.buffer.max_buffer_hole;
        let pos = self.load_position(media);
        let info = buffer_helper::buffer_info(self.own_ranges(media), pos, hole);
        // Audio keeps up with the video buffer even past its own target.
        let max_len = match self.kind {
            PlaylistType::Audio => self
                .buffer_target
                .max(buffer_helper::buffer_info(media.ranges(StreamType::Video), pos, hole).len),
            PlaylistType::Main => self.buffer_target,
        };
        let audio_switch = self.kind == PlaylistType::Audio && self.track_switching;
        if info.len >= max_len && !audio_switch {
            return;
        }

        let Some(details) = self.details() else {
            return;
        };
        if !audio_switch && self.stream_ended(&info, details) {
            debug!(kind = %self.kind, pos, "Track ended");
            self.outbox
                .push(SchedulerCommand::BufferEos(self.own_stream()));
            self.set_state(SchedulerState::Ended);
            return;
        }

        let mut target = if audio_switch { pos } else { info.end };
        if details.live
            && let Some(first) = details.fragments.first()
            && target < first.start - self.config.fragment.max_frag_lookup_tolerance
            && self.start_frag_requested
        {
            let sync = details.live_sync_position(self.config.fragment.live_sync_duration_count);
            warn!(kind = %self.kind, target, window_start = first.start, sync, "Fell behind the live window");
            target = sync;
            if self.kind == PlaylistType::Main && self.loaded_metadata {
                self.outbox.push(SchedulerCommand::Seek(sync));
            }
        }

        let Some(frag) = self.next_fragment(target) else {
            return;
        };
        let frag = match self.details().and_then(|d| d.init_segment.as_ref()) {
            Some(init) if init.data.is_none() => init.fragment.clone(),
            _ => frag,
        };
        self.load_fragment(frag, media);
    }

    fn stream_ended(&self, info: &buffer_helper::BufferInfo, details: &TrackDetails) -> bool {
        if details.live || details.fragments.is_empty() {
            return false;
        }
        if info.end >= details.edge() {
            return true;
        }
        let last_buffered = self.frag_current.as_ref().is_some_and(|frag| {
            !frag.is_init_segment
                && frag.sn == details.end_sn()
                && Some(frag.level) == self.level
                && matches!(
                    self.tracker.state(frag),
                    FragmentState::Ok | FragmentState::Partial
                )
        });
        last_buffered && info.next_start.is_none()
    }

    /// Fragment to load for buffer position `pos`.
    fn next_fragment(&mut self, pos: f64) -> Option<Fragment> {
        let tolerance = self.config.fragment.max_frag_lookup_tolerance;
        let details = self.tracks.get(self.level?)?.details.as_ref()?;
        let first = details.fragments.first()?;

        let mut frag = None;
        if details.live {
            let min_size = self.config.fragment.initial_live_manifest_size;
            if details.fragments.len() < min_size {
                debug!(kind = %self.kind, available = details.fragments.len(), min_size, "Waiting for a longer live playlist");
                return None;
            }
            if !details.pts_known && !self.start_frag_requested && self.start_position.is_none() {
                frag = initial_live_fragment(
                    details,
                    self.frag_previous.as_ref(),
                    &self.tracker,
                    tolerance,
                    self.config.fragment.live_sync_duration_count,
                );
                if let Some(frag) = &frag {
                    self.next_load_position = frag.start;
                }
            }
        } else if pos <= first.start {
            frag = Some(first.clone());
        }
        frag.or_else(|| {
            fragment_at_position(
                details,
                pos,
                details.edge(),
                self.frag_previous.as_ref(),
                &self.tracker,
                tolerance,
            )
        })
    }

    fn load_fragment(&mut self, frag: Fragment, media: &MediaSnapshot) {
        if frag.is_init_segment {
            self.load_init_segment(frag);
            return;
        }
        let frag_state = self.tracker.state(&frag);
        if self.track_switching
            || matches!(frag_state, FragmentState::NotLoaded | FragmentState::Partial)
        {
            if self.kind == PlaylistType::Audio && !self.init_pts.contains_key(&frag.cc) {
                debug!(frag = %frag.label(), cc = frag.cc, "Waiting for the main timeline init PTS");
                self.frag_current = Some(frag);
                self.set_state(SchedulerState::WaitingInitPts);
                return;
            }
            if frag.needs_key() {
                self.load_key(frag);
            } else {
                self.start_frag_load(frag);
            }
        } else if frag_state == FragmentState::Appending {
            // Still appending; the sink may be stalled on it.
            if self.reduce_buffer_target(frag.duration) {
                self.tracker.remove(&frag);
            }
        } else if media.media.is_empty() {
            self.tracker.clear();
        }
    }

    fn next_token(&mut self, frag: &Fragment) -> LoadToken {
        self.epoch += 1;
        let token = LoadToken {
            kind: self.kind,
            level: frag.level,
            sn: frag.sn,
            epoch: self.epoch,
        };
        self.token = Some(token);
        token
    }

    fn load_key(&mut self, frag: Fragment) {
        let token = self.next_token(&frag);
        debug!(kind = %self.kind, frag = %frag.label(), "Loading key");
        self.outbox.push(SchedulerCommand::LoadKey {
            frag: Box::new(frag.clone()),
            token,
        });
        self.frag_current = Some(frag);
        self.set_state(SchedulerState::KeyLoading);
    }

    fn load_init_segment(&mut self, mut frag: Fragment) {
        let token = self.next_token(&frag);
        frag.stats = FragmentStats {
            loading_start: Some(Instant::now()),
            ..FragmentStats::default()
        };
        debug!(kind = %self.kind, frag = %frag.label(), url = %frag.url, "Loading init segment");
        self.outbox.push(SchedulerCommand::LoadFragment {
            frag: Box::new(frag.clone()),
            token,
            progressive: false,
        });
        self.frag_current = Some(frag);
        self.set_state(SchedulerState::FragLoading);
    }

    fn start_frag_load(&mut self, mut frag: Fragment) {
        let token = self.next_token(&frag);
        frag.stats = FragmentStats {
            loading_start: Some(Instant::now()),
            ..FragmentStats::default()
        };
        self.start_frag_requested = true;
        self.next_load_position = frag.end();
        self.chunk_id = 0;
        self.appended.clear();
        self.configure_transmuxer(&frag);

        let transmux = &self.config.transmux;
        let progressive = transmux.progressive && (!frag.encrypted() || transmux.enable_software_aes);
        debug!(
            kind = %self.kind,
            sn = frag.sn,
            level = frag.level,
            cc = frag.cc,
            start = frag.start,
            progressive,
            "Loading fragment"
        );
        self.outbox.push(SchedulerCommand::LoadFragment {
            frag: Box::new(frag.clone()),
            token,
            progressive,
        });
        self.frag_current = Some(frag);
        self.set_state(SchedulerState::FragLoading);
    }

    fn configure_transmuxer(&mut self, frag: &Fragment) {
        let (discontinuity, track_switch, contiguous) = match self.transmux_cursor {
            Some((level, sn, cc)) => (
                cc != frag.cc,
                level != frag.level,
                level == frag.level && sn + 1 == frag.sn,
            ),
            None => (true, true, false),
        };
        let (accurate, init_segment) = self.details().map_or((false, None), |d| {
            (
                d.pts_known || !d.live,
                d.init_segment.as_ref().and_then(|i| i.data.clone()),
            )
        });
        let state = TransmuxState::new(discontinuity, contiguous, accurate, track_switch, frag.start);
        if self.transmux_config.is_none() || !contiguous || discontinuity {
            let track = self.tracks.get(frag.level);
            self.transmux_config = Some(TransmuxConfig {
                audio_codec: track.and_then(|t| t.audio_codec.clone()),
                video_codec: track.and_then(|t| t.video_codec.clone()),
                init_segment,
                duration: frag.duration,
                default_init_pts: self.init_pts.get(&frag.cc).copied(),
            });
        }
        self.transmux_cursor = Some((frag.level, frag.sn, frag.cc));
        if let Some(config) = self.transmux_config.clone() {
            self.outbox
                .push(SchedulerCommand::ConfigureTransmux { config, state });
        }
    }

    fn reduce_buffer_target(&mut self, threshold: f64) -> bool {
        let floor = threshold.max(MIN_BUFFER_TARGET);
        if self.buffer_target <= floor {
            return false;
        }
        self.buffer_target = (self.buffer_target / 2.0).max(floor);
        warn!(kind = %self.kind, target = self.buffer_target, "Reduced buffer target");
        true
    }

    /// Abandon whatever is in flight. Later completions of it are ignored.
    fn abort_load(&mut self) {
        if matches!(
            self.state,
            SchedulerState::KeyLoading | SchedulerState::FragLoading
        ) {
            self.outbox.push(SchedulerCommand::AbortLoad);
        }
        if self.token.take().is_some() {
            self.epoch += 1;
        }
        self.tracker.remove_appending();
        self.retry_at = None;
        self.chunk_id = 0;
        self.appended.clear();
    }

    fn reset_loading_state(&mut self) {
        self.abort_load();
        self.frag_current = None;
        self.frag_previous = None;
        self.set_state(SchedulerState::Idle);
    }

    fn is_current(&self, token: LoadToken) -> bool {
        self.token == Some(token)
    }

    fn token_for_chunk(&self, chunk_meta: &ChunkMetadata) -> Option<LoadToken> {
        self.token.filter(|t| {
            t.epoch == chunk_meta.epoch && t.sn == chunk_meta.sn && t.level == chunk_meta.level
        })
    }

    pub fn on_key_loaded(&mut self, token: LoadToken, key: [u8; 16]) {
        if self.state != SchedulerState::KeyLoading || !self.is_current(token) {
            trace!(kind = %self.kind, sn = token.sn, "Discarding key for an abandoned load");
            return;
        }
        let Some(mut frag) = self.frag_current.take() else {
            return;
        };
        let Some(uri) = frag.decrypt.as_mut().map(|info| {
            info.key = Some(key);
            info.uri.clone()
        }) else {
            return;
        };
        if let Some(level) = self.level
            && let Some(details) = self.tracks.get_mut(level).and_then(|t| t.details.as_mut())
        {
            for other in &mut details.fragments {
                if let Some(info) = other.decrypt.as_mut()
                    && info.uri == uri
                {
                    info.key = Some(key);
                }
            }
        }
        self.set_state(SchedulerState::Idle);
        self.start_frag_load(frag);
    }

    pub fn on_key_load_error(&mut self, token: LoadToken, err: LoadError) {
        if !self.is_current(token) || matches!(err, LoadError::Aborted) {
            return;
        }
        let details = if err.is_timeout() {
            ErrorDetails::KeyLoadTimeout
        } else {
            ErrorDetails::KeyLoadError
        };
        let mut event = ErrorEvent::new(details, true, err.to_string()).with_parent(self.kind);
        if let Some(frag) = &self.frag_current {
            error!(kind = %self.kind, frag = %frag.label(), error = %err, "Key load failed");
            event = event.with_frag(frag);
        }
        self.token = None;
        self.set_state(SchedulerState::Error);
        self.outbox.push(SchedulerCommand::Error(event));
    }

    /// A progressive chunk of the current fragment arrived.
    pub fn on_frag_load_progress(&mut self, token: LoadToken, chunk: Bytes) {
        if !self.is_current(token) || self.state != SchedulerState::FragLoading {
            trace!(kind = %self.kind, sn = token.sn, "Discarding chunk of an abandoned load");
            return;
        }
        self.push_chunk(token, chunk);
    }

    fn push_chunk(&mut self, token: LoadToken, chunk: Bytes) {
        let Some(frag) = self.frag_current.as_mut() else {
            return;
        };
        if frag.is_init_segment || chunk.is_empty() {
            return;
        }
        frag.stats.loaded += chunk.len();
        frag.stats.chunk_count += 1;
        let chunk_meta = ChunkMetadata::new(frag.level, frag.sn, self.chunk_id, chunk.len(), token.epoch);
        self.chunk_id += 1;
        self.outbox.push(SchedulerCommand::TransmuxPush {
            data: chunk,
            decrypt: frag.decrypt_params(),
            chunk_meta,
        });
    }

    /// The load finished; `data` holds whatever was not delivered progressively.
    pub fn on_frag_loaded(&mut self, token: LoadToken, data: Bytes) {
        if !self.is_current(token) || self.state != SchedulerState::FragLoading {
            trace!(kind = %self.kind, sn = token.sn, "Discarding completion of an abandoned load");
            return;
        }
        self.load_errors = 0;

        if self.frag_current.as_ref().is_some_and(|f| f.is_init_segment) {
            let Some(mut frag) = self.frag_current.take() else {
                return;
            };
            frag.stats.loaded = data.len();
            frag.stats.total = data.len();
            frag.stats.loading_end = Some(Instant::now());
            if let Some(init) = self
                .tracks
                .get_mut(frag.level)
                .and_then(|t| t.details.as_mut())
                .and_then(|d| d.init_segment.as_mut())
            {
                init.data = Some(data);
            }
            // New init bytes must reach the transmuxer.
            self.transmux_config = None;
            debug!(kind = %self.kind, frag = %frag.label(), "Init segment loaded");
            self.emit(PlayerEvent::FragLoaded {
                frag: Box::new(frag.clone()),
            });
            self.token = None;
            self.frag_current = Some(frag);
            self.set_state(SchedulerState::Idle);
            return;
        }

        self.push_chunk(token, data);
        let Some(frag) = self.frag_current.as_mut() else {
            return;
        };
        frag.stats.total = frag.stats.loaded;
        frag.stats.loading_end = Some(Instant::now());
        let flush_meta = ChunkMetadata::new(frag.level, frag.sn, self.chunk_id, 0, token.epoch);
        let frag = frag.clone();
        self.tracker.fragment_loaded(&frag);
        trace!(kind = %self.kind, frag = %frag.label(), bytes = frag.stats.loaded, "Fragment loaded");
        self.outbox.push(SchedulerCommand::TransmuxFlush {
            chunk_meta: flush_meta,
        });
        self.emit(PlayerEvent::FragLoaded {
            frag: Box::new(frag),
        });
        self.set_state(SchedulerState::Parsing);
    }

    pub fn on_frag_load_error(&mut self, token: LoadToken, err: LoadError) {
        if !self.is_current(token)
            || self.state != SchedulerState::FragLoading
            || matches!(err, LoadError::Aborted)
        {
            return;
        }
        let Some(frag) = self.frag_current.clone() else {
            return;
        };
        let details = if err.is_timeout() {
            ErrorDetails::FragLoadTimeout
        } else {
            ErrorDetails::FragLoadError
        };
        self.token = None;
        self.epoch += 1;

        let attempt = self.load_errors + 1;
        match self.retry.delay_for_attempt(attempt) {
            Some(delay) => {
                self.load_errors = attempt;
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    frag = %frag.label(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fragment load failed, retrying"
                );
                self.set_state(SchedulerState::FragLoadingWaitingRetry);
                self.outbox.push(SchedulerCommand::Error(
                    ErrorEvent::new(details, false, err.to_string()).with_frag(&frag),
                ));
            }
            None => {
                error!(frag = %frag.label(), attempts = attempt, error = %err, "Fragment load failed, giving up");
                self.set_state(SchedulerState::Error);
                self.outbox.push(SchedulerCommand::Error(
                    ErrorEvent::new(details, true, err.to_string()).with_frag(&frag),
                ));
            }
        }
    }

    pub fn on_transmux_result(&mut self, result: TransmuxResult) {
        let TransmuxResult { remux, chunk_meta } = result;
        let Some(token) = self.token_for_chunk(&chunk_meta) else {
            trace!(kind = %self.kind, sn = chunk_meta.sn, "Discarding stale transmux result");
            return;
        };
        if !matches!(
            self.state,
            SchedulerState::FragLoading | SchedulerState::Parsing
        ) {
            return;
        }
        let Some(cc) = self.frag_current.as_ref().map(|f| f.cc) else {
            return;
        };
        let drop_audio = self.kind == PlaylistType::Main && self.alt_audio;

        if self.kind == PlaylistType::Audio && self.track_switching && remux.audio.is_some() {
            self.complete_audio_switch();
        }

        if let Some(init_pts) = remux.init_pts {
            debug!(kind = %self.kind, cc, init_pts = init_pts.pts, "Init PTS found");
            self.init_pts.insert(cc, init_pts.pts);
            self.outbox.push(SchedulerCommand::InitPtsFound {
                cc,
                init_pts: init_pts.pts,
            });
            self.emit(PlayerEvent::InitPtsFound {
                kind: self.kind,
                cc,
                init_pts: init_pts.pts,
            });
        }

        let init: Vec<_> = remux
            .init
            .into_iter()
            .filter(|t| !(drop_audio && t.stream_type == StreamType::Audio))
            .collect();
        if !init.is_empty() {
            self.outbox.push(SchedulerCommand::BufferCodecs(
                init.iter()
                    .map(|t| BufferTrack {
                        stream: t.stream_type,
                        codec: t.codec.clone(),
                        container: t.container.to_string(),
                    })
                    .collect(),
            ));
            for track in init {
                self.appended.insert(track.stream_type);
                self.outbox.push(SchedulerCommand::BufferAppending {
                    stream: track.stream_type,
                    data: track.data,
                    token,
                    chunk_meta: chunk_meta.clone(),
                });
            }
        }

        for track in [remux.audio, remux.video].into_iter().flatten() {
            if drop_audio && track.stream_type == StreamType::Audio {
                continue;
            }
            self.buffer_track(track, token, &chunk_meta);
        }

        for payload in remux.id3 {
            self.emit(PlayerEvent::Metadata {
                kind: self.kind,
                sn: token.sn,
                pts: payload.pts,
                data: payload.data,
            });
        }
        for payload in remux.text {
            self.emit(PlayerEvent::UserData {
                sn: token.sn,
                pts: payload.pts,
                data: payload.data,
            });
        }
    }

    fn buffer_track(&mut self, track: RemuxedTrack, token: LoadToken, chunk_meta: &ChunkMetadata) {
        let info = ElementaryStreamInfo {
            start_pts: track.start_pts,
            end_pts: track.end_pts,
            start_dts: track.start_dts,
            end_dts: track.end_dts,
        };
        let Some(frag) = self.frag_current.as_mut() else {
            return;
        };
        let mut drift = 0.0;
        for &stream in elementary_streams(track.stream_type) {
            drift = frag.set_elementary_stream_info(stream, info);
        }
        frag.stats.buffering_start.get_or_insert_with(Instant::now);
        trace!(
            frag = %frag.label(),
            stream = %track.stream_type,
            start_pts = info.start_pts,
            end_pts = info.end_pts,
            drift,
            samples = track.samples,
            "Remuxed track"
        );
        let parsed = frag.clone();
        if let Some(details) = self.tracks.get_mut(parsed.level).and_then(|t| t.details.as_mut())
            && let Some(idx) = details.index_of(parsed.sn)
        {
            let listed = &mut details.fragments[idx];
            listed.audio = parsed.audio;
            listed.video = parsed.video;
            listed.start_pts = parsed.start_pts;
            listed.end_pts = parsed.end_pts;
            listed.start_dts = parsed.start_dts;
            listed.end_dts = parsed.end_dts;
            listed.delta_pts = parsed.delta_pts;
            details.pts_known = true;
        }

        if track.mpeg_audio {
            self.outbox.push(SchedulerCommand::LevelPtsUpdated {
                stream: track.stream_type,
                start: info.start_pts,
            });
        }
        self.appended.insert(track.stream_type);
        self.outbox.push(SchedulerCommand::BufferAppending {
            stream: track.stream_type,
            data: track.data,
            token,
            chunk_meta: chunk_meta.clone(),
        });
    }

    fn complete_audio_switch(&mut self) {
        self.track_switching = false;
        info!(level = ?self.level, "Audio track switched, flushing audio buffer");
        self.outbox.push(SchedulerCommand::BufferFlushing {
            stream: Some(StreamType::Audio),
            start: 0.0,
            end: f64::INFINITY,
        });
        if let Some(level) = self.level {
            self.emit(PlayerEvent::TrackSwitched {
                kind: self.kind,
                level,
            });
        }
    }

    pub fn on_transmux_flushed(&mut self, chunk_meta: ChunkMetadata) {
        let Some(token) = self.token_for_chunk(&chunk_meta) else {
            trace!(kind = %self.kind, sn = chunk_meta.sn, "Discarding stale flush");
            return;
        };
        if self.state != SchedulerState::Parsing {
            return;
        }
        let Some(frag) = self.frag_current.as_mut() else {
            return;
        };
        frag.stats.parsing_end = Some(Instant::now());
        let frag = frag.clone();
        let streams: Vec<StreamType> = self.appended.iter().copied().collect();
        debug!(kind = %self.kind, frag = %frag.label(), ?streams, "Fragment parsed");
        self.set_state(SchedulerState::Parsed);
        self.emit(PlayerEvent::FragParsed {
            frag: Box::new(frag.clone()),
        });
        self.outbox.push(SchedulerCommand::FragParsed {
            frag: Box::new(frag),
            token,
            streams,
        });
    }

    pub fn on_transmux_error(&mut self, error: TransmuxError, chunk_meta: ChunkMetadata) {
        if self.token_for_chunk(&chunk_meta).is_none() {
            return;
        }
        let fatal = error.is_fatal();
        let mut event = ErrorEvent::new(ErrorDetails::FragParsingError, fatal, error.to_string())
            .with_parent(self.kind);
        if let Some(frag) = &self.frag_current {
            event = event.with_frag(frag);
        }
        if fatal {
            error!(kind = %self.kind, error = %error, "Unrecoverable transmux error");
            self.token = None;
            self.set_state(SchedulerState::Error);
        } else {
            warn!(kind = %self.kind, error = %error, "Transmux error");
        }
        self.outbox.push(SchedulerCommand::Error(event));
    }

    /// Every append of a parsed fragment has reached the sink.
    pub fn on_frag_buffered(
        &mut self,
        frag: &Fragment,
        token: LoadToken,
        buffered: &[(StreamType, TimeRanges)],
        media: &MediaSnapshot,
    ) {
        if !self.is_current(token) {
            warn!(
                kind = %self.kind,
                frag = %frag.label(),
                state = %self.state,
                "Fragment finished buffering, but its load was aborted"
            );
            return;
        }
        let ranges: Vec<(ElementaryStream, TimeRanges)> = buffered
            .iter()
            .flat_map(|(stream, ranges)| {
                elementary_streams(*stream)
                    .iter()
                    .map(move |es| (*es, ranges.clone()))
            })
            .collect();
        self.tracker.fragment_buffered(frag, &ranges);
        self.frag_previous = Some(frag.clone());
        self.frag_current = Some(frag.clone());
        self.token = None;

        if self.track_switching {
            match self.kind {
                PlaylistType::Audio => self.complete_audio_switch(),
                PlaylistType::Main => {
                    self.track_switching = false;
                    self.emit(PlayerEvent::TrackSwitched {
                        kind: self.kind,
                        level: frag.level,
                    });
                }
            }
        }

        if !self.loaded_metadata {
            self.loaded_metadata = true;
            let start = self.resolved_start;
            if self.kind == PlaylistType::Main
                && start > media.current_time
                && !buffer_helper::is_buffered(self.own_ranges(media), media.current_time)
            {
                debug!(start, "Seeking to the start position");
                self.outbox.push(SchedulerCommand::Seek(start));
            }
        }

        trace!(kind = %self.kind, frag = %frag.label(), "Fragment buffered");
        self.set_state(SchedulerState::Idle);
        self.emit(PlayerEvent::FragBuffered {
            frag: Box::new(frag.clone()),
        });
    }

    pub fn on_buffer_flushed(&mut self, stream: StreamType, media: &MediaSnapshot) {
        if !self.owns_stream(stream) {
            return;
        }
        for &es in elementary_streams(stream) {
            self.tracker.detect_evicted(es, media.ranges(stream));
        }
        if self.state == SchedulerState::Ended {
            self.reset_loading_state();
        }
    }

    /// React to an error reported by any component.
    pub fn on_error(&mut self, event: &ErrorEvent, media: &MediaSnapshot) {
        if !event.concerns(self.kind) {
            return;
        }
        match event.details {
            ErrorDetails::BufferFullError
                if matches!(
                    self.state,
                    SchedulerState::Parsing | SchedulerState::Parsed
                ) =>
            {
                self.on_backpressure(media);
            }
            _ if event.fatal && self.state != SchedulerState::Error => {
                error!(kind = %self.kind, %event, "Halting on fatal error");
                self.abort_load();
                self.set_state(SchedulerState::Error);
            }
            _ => {}
        }
    }

    fn on_backpressure(&mut self, media: &MediaSnapshot) {
        let pos = media.current_time;
        let ranges = match self.config.buffer.backpressure_probe {
            BackpressureProbe::Media => &media.media[..],
            BackpressureProbe::OwnStream => self.own_ranges(media),
        };
        if buffer_helper::is_buffered(ranges, pos)
            && buffer_helper::is_buffered(ranges, pos + BACKPRESSURE_LOOKAHEAD)
        {
            self.reduce_buffer_target(MIN_BUFFER_TARGET);
            self.set_state(SchedulerState::Idle);
        } else {
            warn!(kind = %self.kind, pos, "Sink full with the playhead unbuffered, flushing");
            self.abort_load();
            self.frag_current = None;
            self.outbox.push(SchedulerCommand::BufferFlushing {
                stream: self.own_stream(),
                start: 0.0,
                end: f64::INFINITY,
            });
            self.set_state(SchedulerState::Idle);
        }
    }
}

fn elementary_streams(stream: StreamType) -> &'static [ElementaryStream] {
    match stream {
        StreamType::Audio => &[ElementaryStream::Audio],
        StreamType::Video => &[ElementaryStream::Video],
        StreamType::AudioVideo => &[ElementaryStream::Audio, ElementaryStream::Video],
    }
}

/// Fragment covering `buffer_end`, skipping the previous fragment when it is
/// selected again on the same track.
fn fragment_at_position(
    details: &TrackDetails,
    buffer_end: f64,
    end: f64,
    previous: Option<&Fragment>,
    tracker: &FragmentTracker,
    tolerance: f64,
) -> Option<Fragment> {
    let fragments = &details.fragments;
    let idx = if buffer_end < end {
        let lookup = if buffer_end > end - tolerance { 0.0 } else { tolerance };
        find_fragment_by_pts(previous, fragments, buffer_end, lookup)?
    } else {
        fragments.len().checked_sub(1)?
    };
    let frag = &fragments[idx];
    if let Some(prev) = previous
        && frag.sn == prev.sn
        && frag.level == prev.level
    {
        let next = fragments.get(idx + 1)?;
        return (tracker.state(next) != FragmentState::Ok).then(|| next.clone());
    }
    Some(frag.clone())
}

/// First fragment of a live track: continue from the previous fragment by
/// wall-clock time or sequence number, else start at the live sync position.
fn initial_live_fragment(
    details: &TrackDetails,
    previous: Option<&Fragment>,
    tracker: &FragmentTracker,
    tolerance: f64,
    live_sync_duration_count: u32,
) -> Option<Fragment> {
    let fragments = &details.fragments;
    let Some(prev) = previous else {
        let live_start = details.live_sync_position(live_sync_duration_count);
        return fragment_at_position(details, live_start, details.edge(), None, tracker, tolerance);
    };
    if details.has_program_date_time()
        && let Some(pdt) = prev.end_program_date_time()
        && let Some(idx) = find_fragment_by_pdt(fragments, pdt, tolerance)
    {
        return Some(fragments[idx].clone());
    }
    if let Some(idx) = details.index_of(prev.sn + 1)
        && fragments[idx].cc == prev.cc
    {
        return Some(fragments[idx].clone());
    }
    fragments.iter().find(|f| f.cc == prev.cc).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::fragment::EncryptionInfo;
    use crate::track::tests::details;
    use transmux::{InitPts, InitTrack, RemuxResult};
    use url::Url;

    fn config() -> Arc<CascadeConfig> {
        Arc::new(CascadeConfig::default())
    }

    fn scheduler_with(kind: PlaylistType, config: Arc<CascadeConfig>, details: TrackDetails) -> Scheduler {
        let url = Url::parse("https://example.com/media.m3u8").unwrap();
        let mut track = Track::new(0, kind, url);
        track.details = Some(details);
        let mut scheduler = Scheduler::new(kind, config);
        scheduler.set_tracks(vec![track], false);
        scheduler.switch_track(0);
        scheduler
    }

    fn vod(count: usize, duration: f64) -> Scheduler {
        scheduler_with(
            PlaylistType::Main,
            config(),
            details(PlaylistType::Main, count, duration, false),
        )
    }

    fn load_requests(commands: &[SchedulerCommand]) -> Vec<(u64, LoadToken)> {
        commands
            .iter()
            .filter_map(|c| match c {
                SchedulerCommand::LoadFragment { frag, token, .. } => Some((frag.sn, *token)),
                _ => None,
            })
            .collect()
    }

    /// Start at `pos` and return the token of the fragment the first tick loads.
    fn start_at(scheduler: &mut Scheduler, pos: f64) -> LoadToken {
        scheduler.start_load(Some(pos));
        scheduler.tick(&MediaSnapshot::default());
        let loads = load_requests(&scheduler.drain_commands());
        assert_eq!(loads.len(), 1);
        loads[0].1
    }

    fn video_result(token: LoadToken, start: f64, end: f64) -> TransmuxResult {
        TransmuxResult {
            remux: RemuxResult {
                init: vec![InitTrack {
                    stream_type: StreamType::Video,
                    codec: "avc1.42c01e".into(),
                    container: "video/mp4",
                    data: Bytes::from_static(b"init"),
                }],
                video: Some(RemuxedTrack {
                    stream_type: StreamType::Video,
                    data: Bytes::from_static(b"moof"),
                    start_pts: start,
                    end_pts: end,
                    start_dts: start,
                    end_dts: end,
                    samples: 10,
                    mpeg_audio: false,
                }),
                init_pts: Some(InitPts {
                    pts: (start * 90_000.0) as i64,
                    timescale: 90_000,
                }),
                ..RemuxResult::default()
            },
            chunk_meta: ChunkMetadata::new(token.level, token.sn, 0, 4, token.epoch),
        }
    }

    fn media_covering(start: f64, end: f64, current_time: f64) -> MediaSnapshot {
        MediaSnapshot {
            current_time,
            seeking: false,
            buffered: HashMap::from([(StreamType::Video, vec![(start, end)])]),
            media: vec![(start, end)],
        }
    }

    /// Drive the fragment of `token` through load and parse, returning it as parsed.
    fn load_and_parse(scheduler: &mut Scheduler, token: LoadToken, start: f64, end: f64) -> Fragment {
        scheduler.on_frag_loaded(token, Bytes::from_static(b"payload"));
        scheduler.on_transmux_result(video_result(token, start, end));
        scheduler.on_transmux_flushed(ChunkMetadata::new(token.level, token.sn, 1, 0, token.epoch));
        assert_eq!(scheduler.state(), SchedulerState::Parsed);
        let commands = scheduler.drain_commands();
        commands
            .into_iter()
            .find_map(|c| match c {
                SchedulerCommand::FragParsed { frag, .. } => Some(*frag),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_vod_position_selects_containing_fragment() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 29.9);
        assert_eq!(token.sn, 4);
        assert_eq!(scheduler.state(), SchedulerState::FragLoading);
    }

    #[test]
    fn test_vod_position_past_end_signals_eos() {
        let mut scheduler = vod(5, 6.0);
        scheduler.start_load(Some(60.0));
        scheduler.tick(&MediaSnapshot::default());
        let commands = scheduler.drain_commands();
        assert!(commands.iter().any(|c| matches!(c, SchedulerCommand::BufferEos(None))));
        assert!(load_requests(&commands).is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Ended);
    }

    #[test]
    fn test_waits_for_missing_details() {
        let url = Url::parse("https://example.com/v.m3u8").unwrap();
        let mut scheduler = Scheduler::new(PlaylistType::Main, config());
        scheduler.set_tracks(vec![Track::new(0, PlaylistType::Main, url)], false);
        scheduler.start_load(None);
        assert_eq!(scheduler.state(), SchedulerState::Starting);
        scheduler.switch_track(0);
        assert_eq!(scheduler.state(), SchedulerState::WaitingTrack);
        assert!(
            scheduler
                .drain_commands()
                .iter()
                .any(|c| matches!(c, SchedulerCommand::LoadTrack { level: 0 }))
        );

        scheduler.on_track_loaded(0, details(PlaylistType::Main, 3, 4.0, false));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        let commands = scheduler.drain_commands();
        assert!(commands.iter().any(|c| matches!(c, SchedulerCommand::LevelUpdated(_))));
    }

    #[test]
    fn test_live_start_uses_sync_position() {
        let mut scheduler = scheduler_with(
            PlaylistType::Main,
            config(),
            details(PlaylistType::Main, 10, 6.0, true),
        );
        scheduler.start_load(None);
        scheduler.tick(&MediaSnapshot::default());
        let loads = load_requests(&scheduler.drain_commands());
        assert_eq!(loads[0].0, 7);
    }

    #[test]
    fn test_buffered_frag_advances_and_configures_contiguously() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        let frag = load_and_parse(&mut scheduler, token, 0.0, 6.0);

        let media = media_covering(0.0, 6.0, 0.0);
        scheduler.on_frag_buffered(&frag, token, &[(StreamType::Video, vec![(0.0, 6.0)])], &media);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.frag_previous().map(|f| f.sn), Some(0));

        scheduler.drain_commands();
        scheduler.tick(&media);
        let commands = scheduler.drain_commands();
        let state = commands
            .iter()
            .find_map(|c| match c {
                SchedulerCommand::ConfigureTransmux { state, .. } => Some(*state),
                _ => None,
            })
            .unwrap();
        assert!(state.contiguous);
        assert!(!state.discontinuity);
        assert!(!state.track_switch);
        assert_eq!(state.time_offset, 6.0);
        assert_eq!(load_requests(&commands)[0].0, 1);
    }

    #[test]
    fn test_buffer_target_reached_waits() {
        let mut scheduler = vod(10, 6.0);
        scheduler.start_load(Some(0.0));
        scheduler.tick(&media_covering(0.0, 40.0, 0.0));
        assert!(load_requests(&scheduler.drain_commands()).is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_parsed_results_emit_sink_work() {
        let mut scheduler = vod(3, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::from_static(b"payload"));
        scheduler.on_transmux_result(video_result(token, 0.0, 6.0));
        let commands = scheduler.drain_commands();

        assert!(commands.iter().any(|c| matches!(
            c,
            SchedulerCommand::InitPtsFound { cc: 0, init_pts: 0 }
        )));
        let codecs = commands
            .iter()
            .position(|c| matches!(c, SchedulerCommand::BufferCodecs(_)))
            .unwrap();
        let appends: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, SchedulerCommand::BufferAppending { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(appends.len(), 2);
        assert!(codecs < appends[0]);
        assert_eq!(scheduler.frag_current().and_then(|f| f.start_pts), Some(0.0));
        let frag = scheduler.frag_current().unwrap();
        assert_eq!(frag.video.map(|v| v.end_pts), Some(6.0));
        assert!(frag.audio.is_none());
        assert!(scheduler.details().unwrap().pts_known);
    }

    #[test]
    fn test_backpressure_with_buffered_playhead_reduces_target() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::from_static(b"payload"));
        assert_eq!(scheduler.state(), SchedulerState::Parsing);
        scheduler.drain_commands();

        let event = ErrorEvent::new(ErrorDetails::BufferFullError, false, "quota")
            .with_parent(PlaylistType::Main);
        scheduler.on_error(&event, &media_covering(0.0, 4.0, 1.0));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.buffer_target(), 15.0);
        let commands = scheduler.drain_commands();
        assert!(
            !commands
                .iter()
                .any(|c| matches!(c, SchedulerCommand::Error(e) if e.fatal))
        );
        assert!(
            !commands
                .iter()
                .any(|c| matches!(c, SchedulerCommand::BufferFlushing { .. }))
        );
    }

    #[test]
    fn test_backpressure_with_unbuffered_playhead_flushes() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::from_static(b"payload"));
        scheduler.drain_commands();

        let event = ErrorEvent::new(ErrorDetails::BufferFullError, false, "quota")
            .with_parent(PlaylistType::Main);
        scheduler.on_error(&event, &media_covering(10.0, 20.0, 1.0));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.buffer_target(), 30.0);
        assert!(scheduler.current_token().is_none());
        assert!(scheduler.drain_commands().iter().any(|c| matches!(
            c,
            SchedulerCommand::BufferFlushing { stream: None, start, end }
                if *start == 0.0 && end.is_infinite()
        )));
    }

    #[test]
    fn test_errors_for_other_scheduler_are_ignored() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::new());
        let event = ErrorEvent::new(ErrorDetails::BufferAppendError, true, "append failed")
            .with_parent(PlaylistType::Audio);
        scheduler.on_error(&event, &MediaSnapshot::default());
        assert_eq!(scheduler.state(), SchedulerState::Parsing);

        let event = ErrorEvent::new(ErrorDetails::BufferAppendError, true, "append failed")
            .with_parent(PlaylistType::Main);
        scheduler.on_error(&event, &MediaSnapshot::default());
        assert_eq!(scheduler.state(), SchedulerState::Error);
    }

    #[test]
    fn test_late_frag_buffered_is_ignored() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        let frag = load_and_parse(&mut scheduler, token, 0.0, 6.0);

        scheduler.stop_load();
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        let reload = load_requests(&scheduler.drain_commands())[0].1;
        assert_eq!(reload.sn, token.sn);
        assert_ne!(reload.epoch, token.epoch);

        scheduler.on_frag_buffered(
            &frag,
            token,
            &[(StreamType::Video, vec![(0.0, 6.0)])],
            &media_covering(0.0, 6.0, 0.0),
        );
        assert_eq!(scheduler.state(), SchedulerState::FragLoading);
        assert!(scheduler.frag_previous().is_none());
        assert!(
            !scheduler
                .drain_commands()
                .iter()
                .any(|c| matches!(c, SchedulerCommand::Event(PlayerEvent::FragBuffered { .. })))
        );
    }

    #[test]
    fn test_stale_transmux_output_is_discarded() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::new());
        let stale = LoadToken {
            epoch: token.epoch - 1,
            ..token
        };
        scheduler.on_transmux_result(video_result(stale, 0.0, 6.0));
        scheduler.on_transmux_flushed(ChunkMetadata::new(0, 0, 0, 0, stale.epoch));
        assert_eq!(scheduler.state(), SchedulerState::Parsing);
        assert!(
            !scheduler
                .drain_commands()
                .iter()
                .any(|c| matches!(c, SchedulerCommand::BufferAppending { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_retries_back_off_then_fail() {
        let config = Arc::new(
            CascadeConfig::builder()
                .fragment_retry(3, Duration::from_millis(1000), Duration::from_millis(8000))
                .build(),
        );
        let mut scheduler = scheduler_with(
            PlaylistType::Main,
            config,
            details(PlaylistType::Main, 5, 6.0, false),
        );
        let mut token = start_at(&mut scheduler, 0.0);

        for expected in [1000u64, 2000, 4000] {
            let failed_at = Instant::now();
            scheduler.on_frag_load_error(token, LoadError::HttpStatus {
                status: 503,
                url: "https://example.com/seg0.ts".into(),
            });
            assert_eq!(scheduler.state(), SchedulerState::FragLoadingWaitingRetry);
            let retry_at = scheduler.retry_at().unwrap();
            assert_eq!(retry_at - failed_at, Duration::from_millis(expected));

            scheduler.tick(&MediaSnapshot::default());
            assert_eq!(scheduler.state(), SchedulerState::FragLoadingWaitingRetry);
            tokio::time::advance(Duration::from_millis(expected)).await;
            scheduler.tick(&MediaSnapshot::default());
            let loads = load_requests(&scheduler.drain_commands());
            assert_eq!(loads.len(), 1);
            token = loads[0].1;
        }

        scheduler.on_frag_load_error(token, LoadError::Timeout {
            url: "https://example.com/seg0.ts".into(),
        });
        assert_eq!(scheduler.state(), SchedulerState::Error);
        let commands = scheduler.drain_commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            SchedulerCommand::Error(e) if e.fatal && e.details == ErrorDetails::FragLoadTimeout
        )));
    }

    #[test]
    fn test_key_loading_precedes_fragment_load() {
        let mut track = details(PlaylistType::Main, 3, 6.0, false);
        for frag in &mut track.fragments {
            frag.decrypt = Some(EncryptionInfo::new("https://example.com/key", None));
        }
        let mut scheduler = scheduler_with(PlaylistType::Main, config(), track);
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        assert_eq!(scheduler.state(), SchedulerState::KeyLoading);
        let token = scheduler
            .drain_commands()
            .into_iter()
            .find_map(|c| match c {
                SchedulerCommand::LoadKey { token, .. } => Some(token),
                _ => None,
            })
            .unwrap();

        scheduler.on_key_loaded(token, [7; 16]);
        assert_eq!(scheduler.state(), SchedulerState::FragLoading);
        assert!(scheduler.details().unwrap().fragments.iter().all(|f| !f.needs_key()));
        let commands = scheduler.drain_commands();
        let frag = commands
            .iter()
            .find_map(|c| match c {
                SchedulerCommand::LoadFragment { frag, .. } => Some(frag),
                _ => None,
            })
            .unwrap();
        assert_eq!(frag.decrypt_params().map(|p| p.key), Some([7; 16]));
    }

    #[test]
    fn test_key_failure_is_fatal() {
        let mut track = details(PlaylistType::Main, 3, 6.0, false);
        track.fragments[0].decrypt = Some(EncryptionInfo::new("https://example.com/key", None));
        let mut scheduler = scheduler_with(PlaylistType::Main, config(), track);
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        let token = scheduler.current_token().unwrap();
        scheduler.on_key_load_error(token, LoadError::network("https://example.com/key", "refused"));
        assert_eq!(scheduler.state(), SchedulerState::Error);
    }

    #[test]
    fn test_init_segment_loads_first() {
        let mut track = details(PlaylistType::Main, 3, 6.0, false);
        let mut init = Fragment::new(PlaylistType::Main, 0, 0, 0.0, 0.0);
        init.is_init_segment = true;
        init.url = "https://example.com/init.mp4".into();
        track.init_segment = Some(crate::track::InitSegment {
            fragment: init,
            data: None,
        });
        let mut scheduler = scheduler_with(PlaylistType::Main, config(), track);
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        let commands = scheduler.drain_commands();
        let (frag, token, progressive) = commands
            .into_iter()
            .find_map(|c| match c {
                SchedulerCommand::LoadFragment {
                    frag,
                    token,
                    progressive,
                } => Some((frag, token, progressive)),
                _ => None,
            })
            .unwrap();
        assert!(frag.is_init_segment);
        assert!(!progressive);

        scheduler.on_frag_loaded(token, Bytes::from_static(b"ftypmoov"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.tick(&MediaSnapshot::default());
        let commands = scheduler.drain_commands();
        let config = commands
            .iter()
            .find_map(|c| match c {
                SchedulerCommand::ConfigureTransmux { config, .. } => Some(config),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.init_segment.as_deref(), Some(&b"ftypmoov"[..]));
        assert_eq!(load_requests(&commands)[0].0, 0);
    }

    #[test]
    fn test_audio_waits_for_main_init_pts() {
        let mut scheduler = scheduler_with(
            PlaylistType::Audio,
            config(),
            details(PlaylistType::Audio, 4, 6.0, false),
        );
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        assert_eq!(scheduler.state(), SchedulerState::WaitingInitPts);
        assert!(load_requests(&scheduler.drain_commands()).is_empty());

        scheduler.on_init_pts_found(0, 126_000);
        scheduler.tick(&MediaSnapshot::default());
        assert_eq!(scheduler.state(), SchedulerState::FragLoading);
        let commands = scheduler.drain_commands();
        let config = commands
            .iter()
            .find_map(|c| match c {
                SchedulerCommand::ConfigureTransmux { config, .. } => Some(config),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.default_init_pts, Some(126_000));
    }

    #[test]
    fn test_audio_switch_flushes_before_first_append() {
        let url = Url::parse("https://example.com/a.m3u8").unwrap();
        let mut tracks = Vec::new();
        for id in 0..2 {
            let mut track = Track::new(id, PlaylistType::Audio, url.clone());
            track.details = Some(details(PlaylistType::Audio, 4, 6.0, false));
            tracks.push(track);
        }
        let mut scheduler = Scheduler::new(PlaylistType::Audio, config());
        scheduler.set_tracks(tracks, false);
        scheduler.switch_track(0);
        scheduler.on_init_pts_found(0, 0);
        scheduler.start_load(Some(0.0));
        scheduler.tick(&MediaSnapshot::default());
        scheduler.drain_commands();

        scheduler.switch_track(1);
        let commands = scheduler.drain_commands();
        assert!(commands.iter().any(|c| matches!(c, SchedulerCommand::AbortLoad)));
        assert!(commands.iter().any(|c| matches!(c, SchedulerCommand::ResetTransmuxer)));

        scheduler.tick(&MediaSnapshot::default());
        let token = load_requests(&scheduler.drain_commands())[0].1;
        assert_eq!(token.level, 1);
        scheduler.on_frag_loaded(token, Bytes::new());
        scheduler.on_transmux_result(TransmuxResult {
            remux: RemuxResult {
                audio: Some(RemuxedTrack {
                    stream_type: StreamType::Audio,
                    data: Bytes::from_static(b"moof"),
                    start_pts: 0.0,
                    end_pts: 6.0,
                    start_dts: 0.0,
                    end_dts: 6.0,
                    samples: 280,
                    mpeg_audio: false,
                }),
                ..RemuxResult::default()
            },
            chunk_meta: ChunkMetadata::new(1, token.sn, 0, 4, token.epoch),
        });
        let commands = scheduler.drain_commands();
        let flush = commands
            .iter()
            .position(|c| matches!(c, SchedulerCommand::BufferFlushing { stream: Some(StreamType::Audio), .. }))
            .unwrap();
        let append = commands
            .iter()
            .position(|c| matches!(c, SchedulerCommand::BufferAppending { .. }))
            .unwrap();
        assert!(flush < append);
        assert!(commands.iter().any(|c| matches!(
            c,
            SchedulerCommand::Event(PlayerEvent::TrackSwitched { level: 1, .. })
        )));
    }

    #[test]
    fn test_main_drops_audio_with_alternate_rendition() {
        let url = Url::parse("https://example.com/v.m3u8").unwrap();
        let mut track = Track::new(0, PlaylistType::Main, url);
        track.details = Some(details(PlaylistType::Main, 3, 6.0, false));
        let mut scheduler = Scheduler::new(PlaylistType::Main, config());
        scheduler.set_tracks(vec![track], true);
        scheduler.switch_track(0);
        let token = start_at(&mut scheduler, 0.0);
        scheduler.on_frag_loaded(token, Bytes::new());
        let mut result = video_result(token, 0.0, 6.0);
        result.remux.audio = Some(RemuxedTrack {
            stream_type: StreamType::Audio,
            data: Bytes::from_static(b"moof"),
            start_pts: 0.0,
            end_pts: 6.0,
            start_dts: 0.0,
            end_dts: 6.0,
            samples: 280,
            mpeg_audio: false,
        });
        scheduler.on_transmux_result(result);
        let streams: Vec<StreamType> = scheduler
            .drain_commands()
            .iter()
            .filter_map(|c| match c {
                SchedulerCommand::BufferAppending { stream, .. } => Some(*stream),
                _ => None,
            })
            .collect();
        assert_eq!(streams, vec![StreamType::Video, StreamType::Video]);
    }

    #[test]
    fn test_first_buffered_fragment_seeks_to_start() {
        let mut scheduler = vod(5, 6.0);
        let token = start_at(&mut scheduler, 29.9);
        let frag = load_and_parse(&mut scheduler, token, 24.0, 30.0);
        scheduler.on_frag_buffered(
            &frag,
            token,
            &[(StreamType::Video, vec![(24.0, 30.0)])],
            &media_covering(24.0, 30.0, 0.0),
        );
        assert!(
            scheduler
                .drain_commands()
                .iter()
                .any(|c| matches!(c, SchedulerCommand::Seek(pos) if *pos == 29.9))
        );
    }

    #[test]
    fn test_reaching_end_after_last_fragment() {
        let mut scheduler = vod(2, 6.0);
        let token = start_at(&mut scheduler, 6.5);
        assert_eq!(token.sn, 1);
        let frag = load_and_parse(&mut scheduler, token, 6.0, 11.98);
        let media = media_covering(6.0, 11.98, 6.5);
        scheduler.on_frag_buffered(&frag, token, &[(StreamType::Video, vec![(6.0, 11.98)])], &media);
        scheduler.drain_commands();
        scheduler.tick(&media);
        assert_eq!(scheduler.state(), SchedulerState::Ended);
        assert!(
            scheduler
                .drain_commands()
                .iter()
                .any(|c| matches!(c, SchedulerCommand::BufferEos(None)))
        );
    }
}
