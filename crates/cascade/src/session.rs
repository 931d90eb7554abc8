//! The playback session: one control loop that owns the schedulers, the buffer
//! coordinator and the transmux workers, and carries out their requests.
//!
//! Every input (tick, load completion, transmux output, sink signal, barrier
//! release, control command) arrives on a typed channel and is handled on the
//! loop's task, so none of the components needs interior locking. After each
//! input the queued scheduler commands and coordinator events are pumped until
//! nothing is left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use transmux::{TransmuxEvent, TransmuxWorker, TransmuxerOptions};
use url::Url;

use crate::buffer::{BufferCoordinator, CoordinatorEvent};
use crate::config::CascadeConfig;
use crate::error::{CascadeError, ErrorDetails, ErrorEvent, LoadError};
use crate::events::PlayerEvent;
use crate::fragment::{Fragment, LoadToken, PlaylistType};
use crate::key::{HttpKeyProvider, KeyProvider};
use crate::loader::{HttpSegmentLoader, LoadRequest, ProgressCallback, SegmentLoader};
use crate::playlist::{M3u8ManifestProvider, ManifestProvider};
use crate::scheduler::{Scheduler, SchedulerCommand};
use crate::sink::{PlaybackSink, SinkSignal};
use crate::track::TrackDetails;

/// Shortest interval between live playlist refreshes.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Control requests from the embedding application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    SwitchTrack(usize),
    SwitchAudioTrack(usize),
    Seek(f64),
    Pause,
    Resume,
    /// End the session, returning the sink.
    Stop,
}

/// Cloneable remote control of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<(), CascadeError> {
        self.commands
            .send(command)
            .map_err(|_| CascadeError::internal("session is no longer running"))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

pub struct SessionBuilder<S: PlaybackSink> {
    config: CascadeConfig,
    sink: S,
    loader: Option<Arc<dyn SegmentLoader>>,
    keys: Option<Arc<dyn KeyProvider>>,
    manifests: Option<Arc<dyn ManifestProvider>>,
    events: Option<mpsc::UnboundedSender<PlayerEvent>>,
    token: Option<CancellationToken>,
}

impl<S: PlaybackSink> SessionBuilder<S> {
    pub fn segment_loader(mut self, loader: Arc<dyn SegmentLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn manifest_provider(mut self, manifests: Arc<dyn ManifestProvider>) -> Self {
        self.manifests = Some(manifests);
        self
    }

    pub fn events(mut self, events: mpsc::UnboundedSender<PlayerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Collaborators left unset use the HTTP implementations.
    pub fn build(self) -> Result<Session<S>, CascadeError> {
        let token = self.token.unwrap_or_default();
        let needs_client =
            self.loader.is_none() || self.keys.is_none() || self.manifests.is_none();
        let client = if needs_client {
            Some(self.config.create_client().map_err(|e| CascadeError::Configuration {
                reason: format!("failed to build HTTP client: {e}"),
            })?)
        } else {
            None
        };
        let loader = match (self.loader, &client) {
            (Some(loader), _) => loader,
            (None, Some(client)) => Arc::new(HttpSegmentLoader::new(client.clone())),
            (None, None) => return Err(CascadeError::internal("no segment loader")),
        };
        let keys = match (self.keys, &client) {
            (Some(keys), _) => keys,
            (None, Some(client)) => Arc::new(HttpKeyProvider::new(
                client.clone(),
                self.config.key.clone(),
                token.child_token(),
            )),
            (None, None) => return Err(CascadeError::internal("no key provider")),
        };
        let manifests = match (self.manifests, client) {
            (Some(manifests), _) => manifests,
            (None, Some(client)) => Arc::new(M3u8ManifestProvider::new(
                client,
                self.config.network.clone(),
            )),
            (None, None) => return Err(CascadeError::internal("no manifest provider")),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Session {
            config: Arc::new(self.config),
            sink: self.sink,
            loader,
            keys,
            manifests,
            events: self.events,
            token,
            commands_tx,
            commands_rx,
        })
    }
}

pub struct Session<S: PlaybackSink> {
    config: Arc<CascadeConfig>,
    sink: S,
    loader: Arc<dyn SegmentLoader>,
    keys: Arc<dyn KeyProvider>,
    manifests: Arc<dyn ManifestProvider>,
    events: Option<mpsc::UnboundedSender<PlayerEvent>>,
    token: CancellationToken,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<S: PlaybackSink> Session<S> {
    pub fn builder(config: CascadeConfig, sink: S) -> SessionBuilder<S> {
        SessionBuilder {
            config,
            sink,
            loader: None,
            keys: None,
            manifests: None,
            events: None,
            token: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            token: self.token.clone(),
        }
    }

    /// Play `url` until every track has ended, the session is stopped, or a
    /// fatal error occurs. Returns the sink on a clean end.
    pub async fn run(self, url: &Url) -> Result<S, CascadeError> {
        let Session {
            config,
            mut sink,
            loader,
            keys,
            manifests,
            events,
            token,
            commands_tx,
            commands_rx,
        } = self;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (barrier_tx, barrier_rx) = mpsc::unbounded_channel();
        let (load_tx, load_rx) = mpsc::unbounded_channel();
        let (main_transmux_tx, main_transmux_rx) = mpsc::unbounded_channel();
        let (audio_transmux_tx, audio_transmux_rx) = mpsc::unbounded_channel();
        sink.attach(signal_tx);

        let transmux_options = TransmuxerOptions {
            enable_software_aes: config.transmux.enable_software_aes,
        };
        let mut engine = Engine {
            coordinator: BufferCoordinator::new(sink, config.buffer.clone(), barrier_tx),
            main: Scheduler::new(PlaylistType::Main, config.clone()),
            audio: Scheduler::new(PlaylistType::Audio, config.clone()),
            main_worker: TransmuxWorker::spawn(transmux_options, main_transmux_tx.clone()),
            audio_worker: TransmuxWorker::spawn(transmux_options, audio_transmux_tx.clone()),
            transmux_options,
            main_transmux_tx,
            audio_transmux_tx,
            config,
            loader,
            keys,
            manifests,
            load_tx,
            fragment_loads: HashMap::new(),
            track_loads: HashMap::new(),
            refresh_at: HashMap::new(),
            alt_audio: false,
            events,
            outcome: None,
            _commands_tx: commands_tx,
        };
        let inbox = Inbox {
            signals: signal_rx,
            barriers: barrier_rx,
            loads: load_rx,
            main_transmux: main_transmux_rx,
            audio_transmux: audio_transmux_rx,
            commands: commands_rx,
        };

        let result = tokio::select! {
            _ = token.cancelled() => Err(CascadeError::Cancelled),
            result = engine.start(url) => result,
        };
        if let Err(err) = result {
            engine.abort_all();
            return Err(err);
        }
        let outcome = engine.run(inbox, &token).await;
        engine.abort_all();
        outcome.map(|()| engine.coordinator.into_sink())
    }
}

struct Inbox {
    signals: mpsc::UnboundedReceiver<SinkSignal>,
    barriers: mpsc::UnboundedReceiver<u64>,
    loads: mpsc::UnboundedReceiver<LoadMessage>,
    main_transmux: mpsc::UnboundedReceiver<TransmuxEvent>,
    audio_transmux: mpsc::UnboundedReceiver<TransmuxEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

/// Outcome of a spawned request.
#[derive(Debug)]
enum LoadMessage {
    Progress {
        token: LoadToken,
        chunk: Bytes,
    },
    Loaded {
        token: LoadToken,
        data: Bytes,
    },
    Failed {
        token: LoadToken,
        error: LoadError,
    },
    Key {
        token: LoadToken,
        result: Result<[u8; 16], LoadError>,
    },
    Track {
        kind: PlaylistType,
        level: usize,
        result: Result<TrackDetails, LoadError>,
    },
}

struct Engine<S: PlaybackSink> {
    config: Arc<CascadeConfig>,
    loader: Arc<dyn SegmentLoader>,
    keys: Arc<dyn KeyProvider>,
    manifests: Arc<dyn ManifestProvider>,
    main: Scheduler,
    audio: Scheduler,
    coordinator: BufferCoordinator<S>,
    transmux_options: TransmuxerOptions,
    main_worker: TransmuxWorker,
    audio_worker: TransmuxWorker,
    main_transmux_tx: mpsc::UnboundedSender<TransmuxEvent>,
    audio_transmux_tx: mpsc::UnboundedSender<TransmuxEvent>,
    load_tx: mpsc::UnboundedSender<LoadMessage>,
    fragment_loads: HashMap<PlaylistType, JoinHandle<()>>,
    track_loads: HashMap<PlaylistType, JoinHandle<()>>,
    refresh_at: HashMap<PlaylistType, Instant>,
    alt_audio: bool,
    events: Option<mpsc::UnboundedSender<PlayerEvent>>,
    /// Set once the session should return.
    outcome: Option<Result<(), CascadeError>>,
    /// Keeps the command channel open while no handle exists.
    _commands_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl<S: PlaybackSink> Engine<S> {
    fn scheduler_mut(&mut self, kind: PlaylistType) -> &mut Scheduler {
        match kind {
            PlaylistType::Main => &mut self.main,
            PlaylistType::Audio => &mut self.audio,
        }
    }

    fn worker(&self, kind: PlaylistType) -> &TransmuxWorker {
        match kind {
            PlaylistType::Main => &self.main_worker,
            PlaylistType::Audio => &self.audio_worker,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            trace!("Event receiver dropped");
        }
    }

    async fn start(&mut self, url: &Url) -> Result<(), CascadeError> {
        info!(%url, "Loading manifest");
        let manifest = match self.manifests.load_manifest(url).await {
            Ok(manifest) => manifest,
            Err(err) => {
                error!(%url, error = %err, "Manifest load failed");
                self.emit(PlayerEvent::Error(ErrorEvent::new(
                    ErrorDetails::ManifestLoadError,
                    true,
                    err.to_string(),
                )));
                return Err(err.into());
            }
        };
        let level = manifest
            .best_track()
            .ok_or_else(|| CascadeError::manifest("manifest lists no tracks"))?;
        let audio_level = manifest.audio_track_for(level);
        self.alt_audio = audio_level.is_some();
        info!(
            tracks = manifest.tracks.len(),
            audio_tracks = manifest.audio_tracks.len(),
            level,
            ?audio_level,
            "Manifest loaded"
        );
        self.emit(PlayerEvent::ManifestLoaded {
            tracks: manifest.tracks.len(),
            audio_tracks: manifest.audio_tracks.len(),
        });

        self.coordinator.on_manifest_parsed(self.alt_audio);
        self.main.set_tracks(manifest.tracks, self.alt_audio);
        self.main.start_load(None);
        self.main.switch_track(level);
        if let Some(audio_level) = audio_level {
            self.audio.set_tracks(manifest.audio_tracks, false);
            self.audio.start_load(None);
            self.audio.switch_track(audio_level);
        }
        self.pump();
        Ok(())
    }

    async fn run(&mut self, mut inbox: Inbox, token: &CancellationToken) -> Result<(), CascadeError> {
        let mut ticker = tokio::time::interval(self.config.scheduler.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(outcome) = self.outcome.take() {
                return outcome;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Session cancelled");
                    return Err(CascadeError::Cancelled);
                }
                _ = ticker.tick() => self.on_tick(),
                Some(message) = inbox.loads.recv() => self.on_load_message(message),
                Some(signal) = inbox.signals.recv() => self.coordinator.on_sink_signal(signal),
                Some(id) = inbox.barriers.recv() => self.coordinator.on_barrier_released(id),
                Some(event) = inbox.main_transmux.recv() => self.on_transmux_event(PlaylistType::Main, event),
                Some(event) = inbox.audio_transmux.recv() => self.on_transmux_event(PlaylistType::Audio, event),
                Some(command) = inbox.commands.recv() => self.on_command(command),
            }
            self.pump();
            self.coordinator.sink_mut().poll();
        }
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.fragment_loads.drain() {
            handle.abort();
        }
        for (_, handle) in self.track_loads.drain() {
            handle.abort();
        }
    }

    fn on_tick(&mut self) {
        let media = self.coordinator.snapshot();
        self.main.tick(&media);
        if self.alt_audio {
            self.audio.tick(&media);
        }

        let now = Instant::now();
        let due: Vec<PlaylistType> = self
            .refresh_at
            .iter()
            .filter(|&(_, at)| now >= *at)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in due {
            let loading = self
                .track_loads
                .get(&kind)
                .is_some_and(|handle| !handle.is_finished());
            if loading {
                continue;
            }
            self.refresh_at.remove(&kind);
            if let Some(level) = self.scheduler_mut(kind).level() {
                trace!(%kind, level, "Refreshing live playlist");
                self.spawn_track_load(kind, level);
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        debug!(?command, "Session command");
        match command {
            SessionCommand::SwitchTrack(level) => self.main.switch_track(level),
            SessionCommand::SwitchAudioTrack(level) if self.alt_audio => {
                self.audio.switch_track(level)
            }
            SessionCommand::SwitchAudioTrack(level) => {
                warn!(level, "No alternate audio renditions to switch to");
            }
            SessionCommand::Seek(position) => self.coordinator.sink_mut().seek(position),
            SessionCommand::Pause => {
                self.main.pause();
                self.audio.pause();
            }
            SessionCommand::Resume => {
                self.main.resume();
                self.audio.resume();
            }
            SessionCommand::Stop => {
                self.main.stop_load();
                self.audio.stop_load();
                self.outcome = Some(Ok(()));
            }
        }
    }

    fn on_load_message(&mut self, message: LoadMessage) {
        match message {
            LoadMessage::Progress { token, chunk } => {
                self.scheduler_mut(token.kind).on_frag_load_progress(token, chunk);
            }
            LoadMessage::Loaded { token, data } => {
                self.scheduler_mut(token.kind).on_frag_loaded(token, data);
            }
            LoadMessage::Failed { token, error } => {
                self.scheduler_mut(token.kind).on_frag_load_error(token, error);
            }
            LoadMessage::Key { token, result } => match result {
                Ok(key) => self.scheduler_mut(token.kind).on_key_loaded(token, key),
                Err(err) => self.scheduler_mut(token.kind).on_key_load_error(token, err),
            },
            LoadMessage::Track {
                kind,
                level,
                result,
            } => self.on_track_result(kind, level, result),
        }
    }

    fn on_track_result(
        &mut self,
        kind: PlaylistType,
        level: usize,
        result: Result<TrackDetails, LoadError>,
    ) {
        let current = self.scheduler_mut(kind).level() == Some(level);
        match result {
            Ok(details) => {
                let refresh = details.live.then(|| {
                    Duration::try_from_secs_f64(details.target_duration)
                        .unwrap_or(MIN_REFRESH_INTERVAL)
                        .max(MIN_REFRESH_INTERVAL)
                });
                self.scheduler_mut(kind).on_track_loaded(level, details);
                match refresh {
                    Some(interval) if current => {
                        self.refresh_at.insert(kind, Instant::now() + interval);
                    }
                    _ => {
                        self.refresh_at.remove(&kind);
                    }
                }
            }
            Err(LoadError::Aborted) => {}
            Err(err) => {
                // A failed refresh keeps the previous details playable.
                let known = self
                    .scheduler_mut(kind)
                    .tracks()
                    .get(level)
                    .is_some_and(|t| t.details.is_some());
                warn!(%kind, level, error = %err, known, "Playlist load failed");
                if known && current {
                    self.refresh_at
                        .insert(kind, Instant::now() + self.config.fragment.retry_delay);
                }
                let event = ErrorEvent::new(ErrorDetails::ManifestLoadError, !known, err.to_string())
                    .with_parent(kind);
                self.on_error(event);
            }
        }
    }

    fn on_transmux_event(&mut self, kind: PlaylistType, event: TransmuxEvent) {
        let scheduler = self.scheduler_mut(kind);
        match event {
            TransmuxEvent::Result(result) => scheduler.on_transmux_result(result),
            TransmuxEvent::Flushed { chunk_meta } => scheduler.on_transmux_flushed(chunk_meta),
            TransmuxEvent::Error { error, chunk_meta } => {
                scheduler.on_transmux_error(error, chunk_meta)
            }
        }
    }

    /// Drain scheduler commands and coordinator events until both are quiet.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for kind in [PlaylistType::Main, PlaylistType::Audio] {
                let commands = self.scheduler_mut(kind).drain_commands();
                progressed |= !commands.is_empty();
                for command in commands {
                    if let Err(err) = self.dispatch(kind, command) {
                        warn!(%kind, error = %err, "Command failed");
                        self.on_error(
                            ErrorEvent::new(ErrorDetails::InternalException, false, err.to_string())
                                .with_parent(kind),
                        );
                    }
                }
            }
            let events = self.coordinator.drain_events();
            progressed |= !events.is_empty();
            for event in events {
                self.on_coordinator_event(event);
            }
            if !progressed {
                break;
            }
        }
    }

    fn dispatch(&mut self, kind: PlaylistType, command: SchedulerCommand) -> Result<(), CascadeError> {
        match command {
            SchedulerCommand::LoadTrack { level } => self.spawn_track_load(kind, level),
            SchedulerCommand::LoadKey { frag, token } => self.spawn_key_load(*frag, token)?,
            SchedulerCommand::LoadFragment {
                frag,
                token,
                progressive,
            } => self.spawn_fragment_load(&frag, token, progressive),
            SchedulerCommand::AbortLoad => {
                if let Some(handle) = self.fragment_loads.remove(&kind) {
                    trace!(%kind, "Aborting in-flight load");
                    handle.abort();
                }
            }
            SchedulerCommand::ResetTransmuxer => {
                debug!(%kind, "Restarting transmuxer");
                let options = self.transmux_options;
                match kind {
                    PlaylistType::Main => {
                        self.main_worker =
                            TransmuxWorker::spawn(options, self.main_transmux_tx.clone());
                    }
                    PlaylistType::Audio => {
                        self.audio_worker =
                            TransmuxWorker::spawn(options, self.audio_transmux_tx.clone());
                    }
                }
            }
            SchedulerCommand::ConfigureTransmux { config, state } => {
                self.worker(kind).configure(config, state)?;
            }
            SchedulerCommand::TransmuxPush {
                data,
                decrypt,
                chunk_meta,
            } => self.worker(kind).push(data, decrypt, chunk_meta)?,
            SchedulerCommand::TransmuxFlush { chunk_meta } => self.worker(kind).flush(chunk_meta)?,
            SchedulerCommand::BufferCodecs(tracks) => self.coordinator.on_buffer_codecs(tracks),
            SchedulerCommand::BufferAppending {
                stream,
                data,
                token,
                chunk_meta,
            } => self.coordinator.on_buffer_appending(
                stream,
                data,
                kind,
                Some(token),
                Some(chunk_meta),
            ),
            SchedulerCommand::BufferFlushing { stream, start, end } => {
                self.coordinator.on_buffer_flushing(stream, start, end)
            }
            SchedulerCommand::BufferEos(stream) => {
                self.coordinator.on_buffer_eos(stream);
                self.emit(PlayerEvent::BufferEos { kind });
            }
            SchedulerCommand::FragParsed {
                frag,
                token,
                streams,
            } => self.coordinator.on_frag_parsed(*frag, token, &streams),
            SchedulerCommand::LevelUpdated(details) => self.coordinator.on_level_updated(&details),
            SchedulerCommand::LevelPtsUpdated { stream, start } => {
                self.coordinator.on_level_pts_updated(stream, start)
            }
            SchedulerCommand::InitPtsFound { cc, init_pts } => {
                if kind == PlaylistType::Main {
                    self.audio.on_init_pts_found(cc, init_pts);
                }
            }
            SchedulerCommand::Seek(position) => {
                debug!(position, "Seeking");
                self.coordinator.sink_mut().seek(position);
            }
            SchedulerCommand::Error(event) => self.on_error(event),
            SchedulerCommand::Event(event) => self.emit(event),
        }
        Ok(())
    }

    fn on_coordinator_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::BuffersCreated { tracks } => {
                debug!(count = tracks.len(), "Sink buffers created");
            }
            CoordinatorEvent::Appended {
                stream,
                parent,
                buffered,
                ..
            } => self.emit(PlayerEvent::BufferAppended {
                stream,
                parent,
                buffered,
            }),
            CoordinatorEvent::Flushed { stream } => {
                let media = self.coordinator.snapshot();
                self.main.on_buffer_flushed(stream, &media);
                self.audio.on_buffer_flushed(stream, &media);
                self.emit(PlayerEvent::BufferFlushed { stream });
            }
            CoordinatorEvent::FragBuffered {
                frag,
                token,
                buffered,
            } => {
                let media = self.coordinator.snapshot();
                self.scheduler_mut(frag.kind)
                    .on_frag_buffered(&frag, token, &buffered, &media);
            }
            CoordinatorEvent::Ended => {
                info!("Playback reached the end of the stream");
                self.emit(PlayerEvent::Ended);
                self.outcome.get_or_insert(Ok(()));
            }
            CoordinatorEvent::Error(event) => self.on_error(event),
        }
    }

    fn on_error(&mut self, event: ErrorEvent) {
        let media = self.coordinator.snapshot();
        self.main.on_error(&event, &media);
        self.audio.on_error(&event, &media);
        if event.fatal {
            error!(%event, "Fatal error, ending session");
            self.outcome = Some(Err(CascadeError::from(&event)));
        }
        self.emit(PlayerEvent::Error(event));
    }

    fn spawn_track_load(&mut self, kind: PlaylistType, level: usize) {
        let Some(url) = self
            .scheduler_mut(kind)
            .tracks()
            .get(level)
            .map(|t| t.url.clone())
        else {
            warn!(%kind, level, "Playlist requested for unknown track");
            return;
        };
        let manifests = self.manifests.clone();
        let tx = self.load_tx.clone();
        let handle = tokio::spawn(async move {
            let result = manifests.load_details(&url, kind, level).await;
            if tx.send(LoadMessage::Track { kind, level, result }).is_err() {
                trace!(%kind, level, "Session gone before playlist arrived");
            }
        });
        if let Some(previous) = self.track_loads.insert(kind, handle) {
            previous.abort();
        }
    }

    fn spawn_key_load(&mut self, frag: Fragment, token: LoadToken) -> Result<(), CascadeError> {
        let info = frag
            .decrypt
            .ok_or_else(|| CascadeError::internal("key requested for an unencrypted fragment"))?;
        let keys = self.keys.clone();
        let tx = self.load_tx.clone();
        let handle = tokio::spawn(async move {
            let result = keys.load_key(&info).await;
            if tx.send(LoadMessage::Key { token, result }).is_err() {
                trace!(sn = token.sn, "Session gone before key arrived");
            }
        });
        if let Some(previous) = self.fragment_loads.insert(token.kind, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn spawn_fragment_load(&mut self, frag: &Fragment, token: LoadToken, progressive: bool) {
        let request = LoadRequest::for_fragment(frag, &self.config, progressive);
        let on_progress = progressive.then(|| {
            let tx = self.load_tx.clone();
            Box::new(move |chunk: Bytes| {
                if tx.send(LoadMessage::Progress { token, chunk }).is_err() {
                    trace!(sn = token.sn, "Session gone during load");
                }
            }) as ProgressCallback
        });
        let loader = self.loader.clone();
        let tx = self.load_tx.clone();
        let handle = tokio::spawn(async move {
            let message = match loader.load(request, on_progress).await {
                Ok(response) => LoadMessage::Loaded {
                    token,
                    data: response.data,
                },
                Err(error) => LoadMessage::Failed { token, error },
            };
            if tx.send(message).is_err() {
                trace!(sn = token.sn, "Session gone before load completed");
            }
        });
        if let Some(previous) = self.fragment_loads.insert(token.kind, handle) {
            previous.abort();
        }
    }
}
