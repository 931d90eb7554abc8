use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransmuxError {
    /// No demuxer recognised the content although enough bytes were seen to probe every format.
    #[error("no demux matching with content found ({bytes_seen} bytes seen)")]
    UnsupportedContent { bytes_seen: usize },

    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("transmux worker stopped")]
    WorkerClosed,
}

impl TransmuxError {
    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    /// Whether the error must halt loading of the stream.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransmuxError::UnsupportedContent { .. } => true,
            TransmuxError::Decryption { .. } => true,
            TransmuxError::WorkerClosed => true,
        }
    }
}
