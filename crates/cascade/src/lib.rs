//! Adaptive HLS segment streaming.
//!
//! A [`Session`] loads a multivariant playlist, runs one [`Scheduler`] for the
//! main track and one for an alternate audio rendition, feeds fetched
//! fragments through a transmuxer and appends the output to a
//! [`PlaybackSink`] through the [`BufferCoordinator`], which serializes sink
//! operations per buffer.

pub mod buffer;
pub mod buffer_helper;
pub mod config;
pub mod error;
pub mod events;
pub mod fragment;
pub mod fragment_finder;
pub mod fragment_tracker;
pub mod key;
pub mod loader;
pub mod playlist;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod track;

pub use buffer::{BufferCoordinator, BufferTrack, CoordinatorEvent, MediaSnapshot};
pub use buffer_helper::TimeRanges;
pub use config::{BackpressureProbe, CascadeConfig, CascadeConfigBuilder};
pub use error::{CascadeError, ErrorDetails, ErrorEvent, ErrorKind, LoadError, SinkError};
pub use events::PlayerEvent;
pub use fragment::{ByteRange, EncryptionInfo, Fragment, LoadToken, PlaylistType};
pub use key::{HttpKeyProvider, KeyProvider};
pub use loader::{HttpSegmentLoader, LoadRequest, LoadResponse, SegmentLoader};
pub use playlist::{M3u8ManifestProvider, Manifest, ManifestProvider};
pub use scheduler::{Scheduler, SchedulerCommand, SchedulerState};
pub use session::{Session, SessionBuilder, SessionCommand, SessionHandle};
pub use sink::{MemorySink, PlaybackSink, SinkSignal};
pub use track::{Track, TrackDetails};
pub use transmux::StreamType;
