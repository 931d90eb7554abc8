//! Transmuxer running on its own task.
//!
//! Commands travel over an unbounded channel and are handled strictly in order.
//! Offloaded decryption is awaited inside the task, so events leave in the same
//! order the pushes arrived.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::decrypter::DecryptParams;
use crate::error::TransmuxError;
use crate::transmuxer::{
    ChunkMetadata, PushOutcome, TransmuxConfig, TransmuxResult, TransmuxState, Transmuxer,
    TransmuxerOptions,
};

#[derive(Debug)]
pub enum TransmuxCommand {
    Configure {
        config: TransmuxConfig,
        state: TransmuxState,
    },
    Push {
        data: Bytes,
        decrypt: Option<DecryptParams>,
        chunk_meta: ChunkMetadata,
    },
    Flush {
        chunk_meta: ChunkMetadata,
    },
}

#[derive(Debug)]
pub enum TransmuxEvent {
    Result(TransmuxResult),
    /// Every result of the flushed fragment has been sent.
    Flushed { chunk_meta: ChunkMetadata },
    Error {
        error: TransmuxError,
        chunk_meta: ChunkMetadata,
    },
}

/// Handle to a spawned transmux task. Dropping it stops the task.
#[derive(Debug)]
pub struct TransmuxWorker {
    commands: mpsc::UnboundedSender<TransmuxCommand>,
    handle: JoinHandle<()>,
}

impl TransmuxWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: TransmuxerOptions, events: mpsc::UnboundedSender<TransmuxEvent>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(Transmuxer::new(options), rx, events));
        Self { commands, handle }
    }

    fn send(&self, command: TransmuxCommand) -> Result<(), TransmuxError> {
        self.commands
            .send(command)
            .map_err(|_| TransmuxError::WorkerClosed)
    }

    pub fn configure(&self, config: TransmuxConfig, state: TransmuxState) -> Result<(), TransmuxError> {
        self.send(TransmuxCommand::Configure { config, state })
    }

    pub fn push(
        &self,
        data: Bytes,
        decrypt: Option<DecryptParams>,
        chunk_meta: ChunkMetadata,
    ) -> Result<(), TransmuxError> {
        self.send(TransmuxCommand::Push {
            data,
            decrypt,
            chunk_meta,
        })
    }

    pub fn flush(&self, chunk_meta: ChunkMetadata) -> Result<(), TransmuxError> {
        self.send(TransmuxCommand::Flush { chunk_meta })
    }
}

impl Drop for TransmuxWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    mut transmuxer: Transmuxer,
    mut commands: mpsc::UnboundedReceiver<TransmuxCommand>,
    events: mpsc::UnboundedSender<TransmuxEvent>,
) {
    while let Some(command) = commands.recv().await {
        let sent = match command {
            TransmuxCommand::Configure { config, state } => {
                transmuxer.configure(config, state);
                true
            }
            TransmuxCommand::Push {
                data,
                decrypt,
                chunk_meta,
            } => handle_push(&mut transmuxer, data, decrypt, chunk_meta, &events).await,
            TransmuxCommand::Flush { chunk_meta } => match transmuxer.flush(chunk_meta.clone()).await {
                Ok(results) => {
                    results
                        .into_iter()
                        .all(|r| events.send(TransmuxEvent::Result(r)).is_ok())
                        && events.send(TransmuxEvent::Flushed { chunk_meta }).is_ok()
                }
                Err(error) => events.send(TransmuxEvent::Error { error, chunk_meta }).is_ok(),
            },
        };
        if !sent {
            debug!("Transmux event receiver dropped, stopping worker");
            return;
        }
    }
}

async fn handle_push(
    transmuxer: &mut Transmuxer,
    data: Bytes,
    decrypt: Option<DecryptParams>,
    chunk_meta: ChunkMetadata,
    events: &mpsc::UnboundedSender<TransmuxEvent>,
) -> bool {
    let outcome = transmuxer.push(data, decrypt, chunk_meta.clone());
    let results = match outcome {
        Ok(PushOutcome::Ready(result)) => Ok(vec![result]),
        Ok(PushOutcome::Pending) => transmuxer.settle().await,
        Err(error) => Err(error),
    };
    match results {
        Ok(results) => results
            .into_iter()
            .all(|r| events.send(TransmuxEvent::Result(r)).is_ok()),
        Err(error) => {
            warn!(sn = chunk_meta.sn, error = %error, "Transmux push failed");
            events.send(TransmuxEvent::Error { error, chunk_meta }).is_ok()
        }
    }
}
