//! Chunk-level transmuxing: decrypt, probe, demux and remux.
//!
//! A [`Transmuxer`] is fed arbitrary slices of one fragment at a time. Bytes
//! that cannot be identified yet are cached until enough data exists to probe.
//! Offloaded decryption turns a push into [`PushOutcome::Pending`]; later pushes
//! queue behind it so results keep push order, and [`Transmuxer::flush`] always
//! settles pending work first.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, instrument, trace, warn};

use crate::chunk_cache::ChunkCache;
use crate::decrypter::{DecryptParams, Decrypter, PendingDecrypt};
use crate::demux::{Demuxer, DemuxerKind};
use crate::error::TransmuxError;
use crate::remux::{Fmp4Remuxer, PassthroughRemuxer, RemuxContext, RemuxResult, Remuxer};

/// Fewest bytes after which a failed probe means the content is unsupported.
pub fn min_probe_len() -> usize {
    DemuxerKind::PRIORITY
        .iter()
        .map(|kind| kind.min_probe_len())
        .fold(1024, usize::max)
}

/// Per-load configuration, replaced whenever codec or track context changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransmuxConfig {
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub init_segment: Option<Bytes>,
    /// Expected fragment duration in seconds.
    pub duration: f64,
    /// Timestamp baseline to adopt after a discontinuity, in 90 kHz ticks.
    pub default_init_pts: Option<i64>,
}

/// Continuity cursor, set by the scheduler on every fragment transition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransmuxState {
    pub discontinuity: bool,
    pub contiguous: bool,
    pub accurate_time_offset: bool,
    pub track_switch: bool,
    pub time_offset: f64,
}

impl TransmuxState {
    pub fn new(
        discontinuity: bool,
        contiguous: bool,
        accurate_time_offset: bool,
        track_switch: bool,
        time_offset: f64,
    ) -> Self {
        Self {
            discontinuity,
            contiguous,
            accurate_time_offset,
            track_switch,
            time_offset,
        }
    }
}

/// Start and end marks of one pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTiming {
    pub start: Option<Instant>,
    pub end: Option<Instant>,
}

/// Identity of one pushed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub level: usize,
    pub sn: u64,
    /// Position of the chunk within its fragment.
    pub id: u32,
    pub size: usize,
    /// Load context the chunk belongs to; stale epochs are discarded downstream.
    pub epoch: u64,
    pub transmuxing: StageTiming,
}

impl ChunkMetadata {
    pub fn new(level: usize, sn: u64, id: u32, size: usize, epoch: u64) -> Self {
        Self {
            level,
            sn,
            id,
            size,
            epoch,
            transmuxing: StageTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransmuxResult {
    pub remux: RemuxResult,
    pub chunk_meta: ChunkMetadata,
}

impl TransmuxResult {
    fn empty(chunk_meta: ChunkMetadata) -> Self {
        Self {
            remux: RemuxResult::default(),
            chunk_meta,
        }
    }
}

/// Result of [`Transmuxer::push`].
#[derive(Debug)]
pub enum PushOutcome {
    Ready(TransmuxResult),
    /// Decryption runs off-thread; collect the result with [`Transmuxer::settle`].
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub struct TransmuxerOptions {
    /// Decrypt progressively on the calling thread instead of offloading whole payloads.
    pub enable_software_aes: bool,
}

impl Default for TransmuxerOptions {
    fn default() -> Self {
        Self {
            enable_software_aes: true,
        }
    }
}

#[derive(Debug)]
struct DeferredPush {
    data: Bytes,
    decrypt: Option<DecryptParams>,
    chunk_meta: ChunkMetadata,
}

#[derive(Debug)]
struct PendingPush {
    decrypt: PendingDecrypt,
    chunk_meta: ChunkMetadata,
}

#[derive(Debug)]
pub struct Transmuxer {
    options: TransmuxerOptions,
    cache: ChunkCache,
    decrypter: Option<Decrypter>,
    demuxer: Option<Demuxer>,
    remuxer: Option<Remuxer>,
    config: TransmuxConfig,
    state: TransmuxState,
    pending: Option<PendingPush>,
    deferred: VecDeque<DeferredPush>,
}

impl Transmuxer {
    pub fn new(options: TransmuxerOptions) -> Self {
        Self {
            options,
            cache: ChunkCache::new(),
            decrypter: None,
            demuxer: None,
            remuxer: None,
            config: TransmuxConfig::default(),
            state: TransmuxState::default(),
            pending: None,
            deferred: VecDeque::new(),
        }
    }

    pub fn configure(&mut self, config: TransmuxConfig, state: TransmuxState) {
        self.config = config;
        self.state = state;
        if let Some(decrypter) = self.decrypter.as_mut() {
            decrypter.reset();
        }
    }

    pub fn state(&self) -> TransmuxState {
        self.state
    }

    pub fn demuxer_kind(&self) -> Option<DemuxerKind> {
        self.demuxer.as_ref().map(Demuxer::kind)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn push(
        &mut self,
        data: Bytes,
        decrypt: Option<DecryptParams>,
        mut chunk_meta: ChunkMetadata,
    ) -> Result<PushOutcome, TransmuxError> {
        if self.pending.is_some() {
            trace!(sn = chunk_meta.sn, "Queueing push behind pending decryption");
            self.deferred.push_back(DeferredPush {
                data,
                decrypt,
                chunk_meta,
            });
            return Ok(PushOutcome::Pending);
        }

        chunk_meta.transmuxing.start = Some(Instant::now());
        let mut data = data;

        if let Some(params) = decrypt.filter(|_| !data.is_empty()) {
            if self.options.enable_software_aes {
                let decrypter = self.decrypter.get_or_insert_with(Decrypter::new);
                match decrypter.software_decrypt(&data, &params)? {
                    Some(decrypted) => data = decrypted,
                    None => {
                        chunk_meta.transmuxing.end = Some(Instant::now());
                        return Ok(PushOutcome::Ready(TransmuxResult::empty(chunk_meta)));
                    }
                }
            } else {
                debug!(sn = chunk_meta.sn, bytes = data.len(), "Offloading decryption");
                self.pending = Some(PendingPush {
                    decrypt: PendingDecrypt::spawn(data, params),
                    chunk_meta,
                });
                return Ok(PushOutcome::Pending);
            }
        }

        Ok(PushOutcome::Ready(self.transmux(data, chunk_meta)))
    }

    /// Await offloaded decryption and replay every push queued behind it, in order.
    pub async fn settle(&mut self) -> Result<Vec<TransmuxResult>, TransmuxError> {
        let mut results = Vec::new();
        loop {
            if let Some(PendingPush {
                decrypt,
                chunk_meta,
            }) = self.pending.take()
            {
                let decrypted = decrypt.await?;
                results.push(self.transmux(decrypted, chunk_meta));
            }
            let Some(next) = self.deferred.pop_front() else {
                break;
            };
            if let PushOutcome::Ready(result) = self.push(next.data, next.decrypt, next.chunk_meta)? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Finish the current fragment.
    #[instrument(skip(self, chunk_meta), fields(sn = chunk_meta.sn, level = chunk_meta.level))]
    pub async fn flush(
        &mut self,
        mut chunk_meta: ChunkMetadata,
    ) -> Result<Vec<TransmuxResult>, TransmuxError> {
        let mut results = self.settle().await?;
        chunk_meta.transmuxing.start = Some(Instant::now());

        if let Some(decrypter) = self.decrypter.as_mut()
            && let Some(decrypted) = decrypter.flush()?
        {
            results.push(self.transmux(decrypted, chunk_meta.clone()));
        }

        let bytes_seen = self.cache.len();
        if self.demuxer.is_none() && bytes_seen > 0 {
            let cached = self.cache.flush();
            self.configure_transmuxer(&cached, true);
            if self.demuxer.is_some() {
                results.push(self.transmux(cached, chunk_meta.clone()));
            }
        }
        self.cache.reset();
        let time_offset = self.state.time_offset;

        let (Some(demuxer), Some(remuxer)) = (self.demuxer.as_mut(), self.remuxer.as_mut()) else {
            chunk_meta.transmuxing.end = Some(Instant::now());
            if bytes_seen >= min_probe_len() {
                warn!(bytes_seen, "No demuxer matched the fragment content");
                return Err(TransmuxError::UnsupportedContent { bytes_seen });
            }
            results.push(TransmuxResult::empty(chunk_meta));
            return Ok(results);
        };

        let demuxed = demuxer.flush();
        let ctx = RemuxContext {
            time_offset,
            contiguous: true,
            accurate_time_offset: self.state.accurate_time_offset,
            init_segment: self.config.init_segment.as_ref(),
            audio_codec: self.config.audio_codec.as_deref(),
            video_codec: self.config.video_codec.as_deref(),
        };
        let remux = remuxer.remux(demuxed, &ctx);
        debug!("Flushed fragment");
        chunk_meta.transmuxing.end = Some(Instant::now());
        results.push(TransmuxResult { remux, chunk_meta });
        Ok(results)
    }

    fn transmux(&mut self, data: Bytes, mut chunk_meta: ChunkMetadata) -> TransmuxResult {
        chunk_meta.transmuxing.start.get_or_insert_with(Instant::now);
        let TransmuxState {
            discontinuity,
            contiguous,
            track_switch,
            ..
        } = self.state;

        if discontinuity || track_switch {
            self.reset_init_segment();
        }
        if discontinuity {
            self.reset_initial_timestamp();
        }
        if !contiguous {
            self.reset_contiguity();
        }

        let mut data = data;
        if self.needs_probing(&data, discontinuity, track_switch) {
            if !self.cache.is_empty() {
                let cached = self.cache.flush();
                let mut joined = BytesMut::with_capacity(cached.len() + data.len());
                joined.extend_from_slice(&cached);
                joined.extend_from_slice(&data);
                data = joined.freeze();
            }
            self.configure_transmuxer(&data, false);
        }

        let (Some(demuxer), Some(remuxer)) = (self.demuxer.as_mut(), self.remuxer.as_mut()) else {
            trace!(bytes = data.len(), "Caching bytes until probe succeeds");
            self.cache.push(data);
            chunk_meta.transmuxing.end = Some(Instant::now());
            return TransmuxResult::empty(chunk_meta);
        };

        let demuxed = demuxer.demux(data, self.state.time_offset);
        let ctx = RemuxContext {
            time_offset: self.state.time_offset,
            contiguous: self.state.contiguous,
            accurate_time_offset: self.state.accurate_time_offset,
            init_segment: self.config.init_segment.as_ref(),
            audio_codec: self.config.audio_codec.as_deref(),
            video_codec: self.config.video_codec.as_deref(),
        };
        let remux = remuxer.remux(demuxed, &ctx);

        self.state.contiguous = true;
        self.state.discontinuity = false;
        self.state.track_switch = false;

        chunk_meta.transmuxing.end = Some(Instant::now());
        TransmuxResult { remux, chunk_meta }
    }

    fn needs_probing(&self, data: &[u8], discontinuity: bool, track_switch: bool) -> bool {
        match &self.demuxer {
            None => true,
            Some(demuxer) => (discontinuity || track_switch) && !demuxer.kind().probe(data),
        }
    }

    /// Bind the first container in priority order that matches `data`.
    ///
    /// Until `complete`, a match only counts once every higher-priority
    /// container has seen enough bytes to be ruled out.
    fn configure_transmuxer(&mut self, data: &[u8], complete: bool) {
        let Some(kind) = identify(data, complete) else {
            self.demuxer = None;
            self.remuxer = None;
            return;
        };
        info!(?kind, bytes = data.len(), "Probe succeeded");
        self.demuxer = Some(kind.create());
        self.remuxer = Some(match kind {
            DemuxerKind::Mp4 => Remuxer::Passthrough(PassthroughRemuxer::new()),
            DemuxerKind::Ts | DemuxerKind::Aac | DemuxerKind::Mp3 => {
                Remuxer::Fragmented(Fmp4Remuxer::new())
            }
        });
        self.reset_init_segment();
        self.reset_initial_timestamp();
    }

    fn reset_init_segment(&mut self) {
        let audio_codec = self.config.audio_codec.as_deref();
        let video_codec = self.config.video_codec.as_deref();
        if let (Some(demuxer), Some(remuxer)) = (self.demuxer.as_mut(), self.remuxer.as_mut()) {
            demuxer.reset_init_segment(audio_codec, video_codec);
            remuxer.reset_init_segment();
        }
    }

    fn reset_initial_timestamp(&mut self) {
        let default_init_pts = self.config.default_init_pts;
        if let (Some(demuxer), Some(remuxer)) = (self.demuxer.as_mut(), self.remuxer.as_mut()) {
            demuxer.reset_timestamp(default_init_pts);
            remuxer.reset_timestamp(default_init_pts);
        }
    }

    fn reset_contiguity(&mut self) {
        if let (Some(demuxer), Some(remuxer)) = (self.demuxer.as_mut(), self.remuxer.as_mut()) {
            demuxer.reset_contiguity();
            remuxer.reset_next_timestamp();
        }
    }
}

fn identify(data: &[u8], complete: bool) -> Option<DemuxerKind> {
    for kind in DemuxerKind::PRIORITY {
        if kind.probe(data) {
            return Some(kind);
        }
        if !complete && data.len() < kind.min_probe_len() {
            return None;
        }
    }
    None
}

impl Default for Transmuxer {
    fn default() -> Self {
        Self::new(TransmuxerOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypter::tests::encrypt;
    use crate::demux::adts;
    use crate::demux::ts::PACKET_LEN;
    use crate::demux::ts::tests::{AUDIO_PID, segment};
    use crate::remux::StreamType;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [0x11; 16];
    const IV: [u8; 16] = [0x22; 16];

    fn meta(sn: u64, id: u32) -> ChunkMetadata {
        ChunkMetadata::new(0, sn, id, 0, 1)
    }

    fn fresh_state(time_offset: f64) -> TransmuxState {
        TransmuxState::new(true, false, true, false, time_offset)
    }

    fn ready(outcome: PushOutcome) -> TransmuxResult {
        match outcome {
            PushOutcome::Ready(result) => result,
            PushOutcome::Pending => panic!("expected a ready result"),
        }
    }

    fn video_samples(results: &[TransmuxResult]) -> usize {
        results
            .iter()
            .filter_map(|r| r.remux.video.as_ref())
            .map(|v| v.samples)
            .sum()
    }

    fn audio_samples(results: &[TransmuxResult]) -> usize {
        results
            .iter()
            .filter_map(|r| r.remux.audio.as_ref())
            .map(|a| a.samples)
            .sum()
    }

    /// A segment whose first audio packet directly follows PAT and PMT.
    fn audio_led_segment() -> Vec<u8> {
        let data = segment(3, 0);
        let mut packets: Vec<&[u8]> = data.chunks(PACKET_LEN).collect();
        let first_audio = packets
            .iter()
            .position(|p| ((u16::from(p[1] & 0x1F) << 8) | u16::from(p[2])) == AUDIO_PID)
            .unwrap();
        let packet = packets.remove(first_audio);
        packets.insert(2, packet);
        packets.concat()
    }

    /// Push `data` in pieces cycling through `sizes`, then flush.
    async fn run_chunked(
        transmuxer: &mut Transmuxer,
        data: &[u8],
        sizes: &[usize],
        decrypt: Option<DecryptParams>,
    ) -> Vec<TransmuxResult> {
        let mut results = Vec::new();
        let mut sizes = sizes.iter().cycle();
        let mut offset = 0;
        let mut id = 0;
        while offset < data.len() {
            let end = offset
                .saturating_add(*sizes.next().unwrap_or(&data.len()))
                .min(data.len());
            let chunk = Bytes::copy_from_slice(&data[offset..end]);
            if let PushOutcome::Ready(result) =
                transmuxer.push(chunk, decrypt.clone(), meta(0, id)).unwrap()
            {
                results.push(result);
            }
            offset = end;
            id += 1;
        }
        results.extend(transmuxer.flush(meta(0, id)).await.unwrap());
        results
    }

    async fn kind_and_video(data: &[u8], sizes: &[usize]) -> (Option<DemuxerKind>, usize) {
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
        let results = run_chunked(&mut transmuxer, data, sizes, None).await;
        (transmuxer.demuxer_kind(), video_samples(&results))
    }

    #[test]
    fn test_min_probe_len_is_at_least_1024() {
        assert_eq!(min_probe_len(), 1024);
    }

    #[tokio::test]
    async fn test_small_chunk_is_cached_until_probe_succeeds() {
        let data = Bytes::from(segment(3, 0));
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));

        let first = ready(transmuxer.push(data.slice(..100), None, meta(0, 0)).unwrap());
        assert!(first.remux.is_empty());
        assert!(transmuxer.demuxer_kind().is_none());

        let second = ready(transmuxer.push(data.slice(100..), None, meta(0, 1)).unwrap());
        assert_eq!(transmuxer.demuxer_kind(), Some(DemuxerKind::Ts));
        assert!(second.remux.init_pts.is_some());
        let mut init_types: Vec<StreamType> =
            second.remux.init.iter().map(|t| t.stream_type).collect();
        init_types.sort();
        assert_eq!(init_types, vec![StreamType::Audio, StreamType::Video]);

        let flushed = transmuxer.flush(meta(0, 2)).await.unwrap();
        let mut all = vec![second];
        all.extend(flushed);
        assert_eq!(video_samples(&all), 3);
    }

    #[tokio::test]
    async fn test_audio_sync_inside_ts_does_not_win_on_short_first_chunk() {
        let data = audio_led_segment();
        assert_eq!(
            kind_and_video(&data, &[data.len()]).await,
            (Some(DemuxerKind::Ts), 3)
        );
        assert_eq!(
            kind_and_video(&data, &[500, data.len()]).await,
            (Some(DemuxerKind::Ts), 3)
        );
    }

    #[tokio::test]
    async fn test_short_raw_audio_is_identified_at_flush() {
        let mut data = adts::tests::frame(30, 1);
        data.extend(adts::tests::frame(30, 2));
        data.extend(adts::tests::frame(30, 3));
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));

        let pushed = ready(transmuxer.push(Bytes::from(data), None, meta(0, 0)).unwrap());
        assert!(pushed.remux.is_empty());
        assert!(transmuxer.demuxer_kind().is_none());

        let flushed = transmuxer.flush(meta(0, 1)).await.unwrap();
        assert_eq!(transmuxer.demuxer_kind(), Some(DemuxerKind::Aac));
        assert_eq!(audio_samples(&flushed), 3);
        assert_eq!(video_samples(&flushed), 0);
    }

    #[tokio::test]
    async fn test_second_flush_is_empty() {
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
        transmuxer
            .push(Bytes::from(segment(2, 0)), None, meta(0, 0))
            .unwrap();
        let first = transmuxer.flush(meta(0, 1)).await.unwrap();
        assert!(!first.is_empty());
        let second = transmuxer.flush(meta(0, 2)).await.unwrap();
        assert!(second.iter().all(|r| r.remux.is_empty()));
    }

    #[tokio::test]
    async fn test_unsupported_content_reported_once() {
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
        let garbage = Bytes::from(vec![0x5Au8; 4096]);
        let pushed = ready(transmuxer.push(garbage, None, meta(0, 0)).unwrap());
        assert!(pushed.remux.is_empty());

        let err = transmuxer.flush(meta(0, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            TransmuxError::UnsupportedContent { bytes_seen: 4096 }
        ));
        assert!(err.is_fatal());

        let again = transmuxer.flush(meta(0, 2)).await.unwrap();
        assert!(again.iter().all(|r| r.remux.is_empty()));
    }

    #[tokio::test]
    async fn test_short_unidentified_data_is_not_an_error() {
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
        transmuxer
            .push(Bytes::from(vec![0x5Au8; 100]), None, meta(0, 0))
            .unwrap();
        let flushed = transmuxer.flush(meta(0, 1)).await.unwrap();
        assert!(flushed.iter().all(|r| r.remux.is_empty()));
    }

    #[tokio::test]
    async fn test_software_decryption_progressive() {
        let plain = segment(3, 0);
        let cipher = Bytes::from(encrypt(&plain, &KEY, &IV));
        let params = DecryptParams::aes128(KEY, IV);
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));

        let mut results = Vec::new();
        for (i, chunk) in cipher.chunks(1000).enumerate() {
            let outcome = transmuxer
                .push(Bytes::copy_from_slice(chunk), Some(params.clone()), meta(0, i as u32))
                .unwrap();
            results.push(ready(outcome));
        }
        results.extend(transmuxer.flush(meta(0, 99)).await.unwrap());
        assert_eq!(video_samples(&results), 3);
    }

    #[tokio::test]
    async fn test_offloaded_decryption_keeps_push_order() {
        let plain = segment(3, 0);
        let cipher = Bytes::from(encrypt(&plain, &KEY, &IV));
        let params = DecryptParams::aes128(KEY, IV);
        let mut transmuxer = Transmuxer::new(TransmuxerOptions {
            enable_software_aes: false,
        });
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));

        let outcome = transmuxer.push(cipher, Some(params), meta(0, 0)).unwrap();
        assert!(matches!(outcome, PushOutcome::Pending));
        assert!(transmuxer.has_pending());

        // Queued behind the decryption and replayed after it.
        let outcome = transmuxer.push(Bytes::new(), None, meta(0, 1)).unwrap();
        assert!(matches!(outcome, PushOutcome::Pending));

        let results = transmuxer.flush(meta(0, 2)).await.unwrap();
        let ids: Vec<u32> = results.iter().map(|r| r.chunk_meta.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(video_samples(&results), 3);
        assert!(!transmuxer.has_pending());
    }

    #[tokio::test]
    async fn test_discontinuity_resets_baseline() {
        let mut transmuxer = Transmuxer::default();
        transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
        let first = ready(
            transmuxer
                .push(Bytes::from(segment(2, 900_000)), None, meta(0, 0))
                .unwrap(),
        );
        assert_eq!(first.remux.init_pts.unwrap().pts, 900_000);
        transmuxer.flush(meta(0, 1)).await.unwrap();

        // Contiguous follow-up keeps the baseline.
        transmuxer.configure(
            TransmuxConfig::default(),
            TransmuxState::new(false, true, true, false, 0.0),
        );
        let next = ready(
            transmuxer
                .push(Bytes::from(segment(2, 906_000)), None, meta(1, 0))
                .unwrap(),
        );
        assert!(next.remux.init_pts.is_none());
        assert!(next.remux.init.is_empty());
        transmuxer.flush(meta(1, 1)).await.unwrap();

        transmuxer.configure(
            TransmuxConfig::default(),
            TransmuxState::new(true, false, true, false, 20.0),
        );
        let after = ready(
            transmuxer
                .push(Bytes::from(segment(2, 0)), None, meta(2, 0))
                .unwrap(),
        );
        assert_eq!(after.remux.init_pts.unwrap().pts, -1_800_000);
        assert_eq!(after.remux.init.len(), 2);
    }

    fn split_samples(
        data: &[u8],
        sizes: &[usize],
        software_aes: bool,
    ) -> (Option<DemuxerKind>, usize, usize) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (data, decrypt) = if software_aes {
                (encrypt(data, &KEY, &IV), Some(DecryptParams::aes128(KEY, IV)))
            } else {
                (data.to_vec(), None)
            };
            let mut transmuxer = Transmuxer::default();
            transmuxer.configure(TransmuxConfig::default(), fresh_state(0.0));
            let results = run_chunked(&mut transmuxer, &data, sizes, decrypt).await;
            (
                transmuxer.demuxer_kind(),
                audio_samples(&results),
                video_samples(&results),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunked_push_matches_single_push(
            first in 1usize..564,
            rest in proptest::collection::vec(1usize..2000, 1..8),
            software_aes in any::<bool>(),
            audio_led in any::<bool>(),
        ) {
            let data = if audio_led { audio_led_segment() } else { segment(3, 0) };
            let mut sizes = vec![first];
            sizes.extend(rest);
            let whole = split_samples(&data, &[usize::MAX], software_aes);
            let chunked = split_samples(&data, &sizes, software_aes);
            prop_assert_eq!(whole.0, Some(DemuxerKind::Ts));
            prop_assert_eq!(whole.2, 3);
            prop_assert_eq!(chunked, whole);
        }
    }
}
