//! Serialized access to the playback sink.

pub mod coordinator;
pub mod queue;

pub use coordinator::{BufferCoordinator, BufferTrack, CoordinatorEvent, MediaSnapshot};
pub use queue::{BufferOperation, Execution, OperationHandler, OperationQueue};
