use bytes::Bytes;
use transmux::StreamType;

use crate::error::ErrorEvent;
use crate::fragment::{Fragment, PlaylistType};

/// Lifecycle notifications delivered to the embedding application.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    ManifestLoaded {
        tracks: usize,
        audio_tracks: usize,
    },
    TrackLoaded {
        kind: PlaylistType,
        level: usize,
        live: bool,
        fragments: usize,
        /// Shift applied when reconciling a live refresh.
        sliding: f64,
    },
    FragLoaded {
        frag: Box<Fragment>,
    },
    FragParsed {
        frag: Box<Fragment>,
    },
    FragBuffered {
        frag: Box<Fragment>,
    },
    BufferAppended {
        stream: StreamType,
        parent: PlaylistType,
        /// Buffered ranges of the stream after the append.
        buffered: Vec<(f64, f64)>,
    },
    BufferFlushed {
        stream: StreamType,
    },
    BufferEos {
        kind: PlaylistType,
    },
    InitPtsFound {
        kind: PlaylistType,
        cc: u32,
        /// 90 kHz ticks.
        init_pts: i64,
    },
    /// ID3 timed metadata.
    Metadata {
        kind: PlaylistType,
        sn: u64,
        pts: f64,
        data: Bytes,
    },
    /// SEI user data.
    UserData {
        sn: u64,
        pts: f64,
        data: Bytes,
    },
    TrackSwitched {
        kind: PlaylistType,
        level: usize,
    },
    /// Every scheduler reached the end of its track and the sink signalled end of stream.
    Ended,
    Error(ErrorEvent),
}

impl PlayerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerEvent::ManifestLoaded { .. } => "manifest_loaded",
            PlayerEvent::TrackLoaded { .. } => "track_loaded",
            PlayerEvent::FragLoaded { .. } => "frag_loaded",
            PlayerEvent::FragParsed { .. } => "frag_parsed",
            PlayerEvent::FragBuffered { .. } => "frag_buffered",
            PlayerEvent::BufferAppended { .. } => "buffer_appended",
            PlayerEvent::BufferFlushed { .. } => "buffer_flushed",
            PlayerEvent::BufferEos { .. } => "buffer_eos",
            PlayerEvent::InitPtsFound { .. } => "init_pts_found",
            PlayerEvent::Metadata { .. } => "metadata",
            PlayerEvent::UserData { .. } => "user_data",
            PlayerEvent::TrackSwitched { .. } => "track_switched",
            PlayerEvent::Ended => "ended",
            PlayerEvent::Error(_) => "error",
        }
    }
}
