//! Per-stream-type FIFO of sink operations.
//!
//! The head of each queue is the operation in flight. It leaves the queue when
//! the sink reports completion, when it completes synchronously, or when its
//! execution fails while the sink is idle. A barrier stays at the head until
//! its owner shifts it.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{trace, warn};
use transmux::{ChunkMetadata, StreamType};

use crate::error::SinkError;
use crate::fragment::{LoadToken, PlaylistType};

#[derive(Debug)]
pub enum BufferOperation {
    Append {
        data: Bytes,
        parent: PlaylistType,
        /// Fragment the data belongs to; init segments from the transmuxer carry one too.
        frag: Option<LoadToken>,
        chunk_meta: Option<ChunkMetadata>,
    },
    Remove {
        start: f64,
        end: f64,
    },
    /// Abort the sink's pending parse, optionally moving its timestamp offset.
    Abort {
        timestamp_offset: Option<f64>,
    },
    /// Resolves `release` once every earlier operation of the type has finished.
    Barrier {
        release: Option<oneshot::Sender<()>>,
    },
}

impl BufferOperation {
    pub fn name(&self) -> &'static str {
        match self {
            BufferOperation::Append { .. } => "append",
            BufferOperation::Remove { .. } => "remove",
            BufferOperation::Abort { .. } => "abort",
            BufferOperation::Barrier { .. } => "barrier",
        }
    }
}

/// Outcome of starting an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Started; the sink will signal completion.
    Pending,
    /// Finished synchronously; `on_complete` runs and the queue moves on.
    Completed,
    /// Nothing to do; the queue moves on without `on_complete`.
    Skipped,
    /// Holds the head until shifted explicitly.
    Blocked,
}

/// Executes operations against the sink and observes their outcome.
pub trait OperationHandler {
    fn has_buffer(&self, stream: StreamType) -> bool;

    fn is_updating(&self, stream: StreamType) -> bool;

    fn execute(
        &mut self,
        stream: StreamType,
        operation: &mut BufferOperation,
    ) -> Result<Execution, SinkError>;

    fn on_complete(&mut self, stream: StreamType, operation: BufferOperation);

    fn on_error(&mut self, stream: StreamType, operation: &BufferOperation, error: SinkError);
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    queues: HashMap<StreamType, VecDeque<BufferOperation>>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, stream: StreamType) -> usize {
        self.queues.get(&stream).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, stream: StreamType) -> bool {
        self.len(stream) == 0
    }

    /// Operation at the head of the queue, in flight or about to be.
    pub fn current(&self, stream: StreamType) -> Option<&BufferOperation> {
        self.queues.get(&stream).and_then(VecDeque::front)
    }

    /// Enqueue `operation`, starting it right away when the queue was idle.
    pub fn append(
        &mut self,
        stream: StreamType,
        operation: BufferOperation,
        handler: &mut impl OperationHandler,
    ) {
        let queue = self.queues.entry(stream).or_default();
        trace!(%stream, op = operation.name(), queued = queue.len(), "Queueing buffer operation");
        queue.push_back(operation);
        if queue.len() == 1 && handler.has_buffer(stream) {
            self.execute_next(stream, handler);
        }
    }

    /// Enqueue a barrier and return the receiver it resolves.
    pub fn append_blocker(
        &mut self,
        stream: StreamType,
        handler: &mut impl OperationHandler,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.append(stream, BufferOperation::Barrier { release: Some(tx) }, handler);
        rx
    }

    /// Start the head operation, moving past any that finish synchronously or fail.
    pub fn execute_next(&mut self, stream: StreamType, handler: &mut impl OperationHandler) {
        let Some(queue) = self.queues.get_mut(&stream) else {
            return;
        };
        while let Some(operation) = queue.front_mut() {
            match handler.execute(stream, operation) {
                Ok(Execution::Pending) | Ok(Execution::Blocked) => return,
                Ok(Execution::Completed) => {
                    if let Some(operation) = queue.pop_front() {
                        handler.on_complete(stream, operation);
                    }
                }
                Ok(Execution::Skipped) => {
                    queue.pop_front();
                }
                Err(error) => {
                    warn!(%stream, op = operation.name(), %error, "Buffer operation failed to start");
                    handler.on_error(stream, operation, error);
                    if handler.is_updating(stream) {
                        // The sink still owes a completion signal for this head.
                        return;
                    }
                    queue.pop_front();
                }
            }
        }
    }

    /// Drop the head without completing it, then start the next operation.
    pub fn shift_and_execute_next(&mut self, stream: StreamType, handler: &mut impl OperationHandler) {
        if let Some(queue) = self.queues.get_mut(&stream) {
            queue.pop_front();
        }
        self.execute_next(stream, handler);
    }

    /// The sink finished the head operation.
    pub fn on_update_end(&mut self, stream: StreamType, handler: &mut impl OperationHandler) {
        let Some(queue) = self.queues.get_mut(&stream) else {
            return;
        };
        if matches!(queue.front(), None | Some(BufferOperation::Barrier { .. })) {
            trace!(%stream, "Ignoring completion with no operation in flight");
            return;
        }
        if let Some(operation) = queue.pop_front() {
            handler.on_complete(stream, operation);
        }
        self.execute_next(stream, handler);
    }

    /// The sink failed the head operation; its completion signal follows.
    pub fn on_update_error(
        &mut self,
        stream: StreamType,
        error: SinkError,
        handler: &mut impl OperationHandler,
    ) {
        if let Some(operation) = self.queues.get(&stream).and_then(VecDeque::front) {
            handler.on_error(stream, operation, error);
        }
    }
}
