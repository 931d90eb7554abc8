//! Chunked HLS transmuxing.
//!
//! Byte chunks of one media fragment go in; sink-appendable fMP4 segments come
//! out. The pipeline decrypts AES-128 content, sniffs the container (MPEG-TS,
//! fragmented MP4, raw AAC or MP3), demuxes it into elementary tracks and
//! remuxes those tracks while keeping timestamps continuous across fragments.

pub mod chunk_cache;
pub mod decrypter;
pub mod demux;
pub mod error;
pub mod isobmff;
pub mod remux;
pub mod transmuxer;
pub mod worker;

pub use chunk_cache::ChunkCache;
pub use decrypter::{DecryptMethod, DecryptParams, Decrypter, PendingDecrypt};
pub use demux::{DemuxerKind, MPEG_TIMESCALE};
pub use error::TransmuxError;
pub use remux::{InitPts, InitTrack, RemuxResult, RemuxedTrack, StreamType, TimedPayload};
pub use transmuxer::{
    ChunkMetadata, PushOutcome, StageTiming, TransmuxConfig, TransmuxResult, TransmuxState,
    Transmuxer, TransmuxerOptions, min_probe_len,
};
pub use worker::{TransmuxCommand, TransmuxEvent, TransmuxWorker};
