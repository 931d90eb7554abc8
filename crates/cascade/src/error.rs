use std::fmt;

use transmux::{StreamType, TransmuxError};

use crate::fragment::{Fragment, PlaylistType};

/// Failure of a segment, key or playlist request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("request for {url} timed out")]
    Timeout { url: String },

    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("request for {url} failed with HTTP {status}")]
    HttpStatus { status: u16, url: String },

    #[error("invalid content from {url}: {reason}")]
    InvalidContent { url: String, reason: String },

    #[error("request aborted")]
    Aborted,
}

impl LoadError {
    pub fn network(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_content(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContent {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Convert a reqwest error, keeping timeouts distinguishable.
    pub fn from_reqwest(url: impl Into<String>, err: &reqwest::Error) -> Self {
        let url = url.into();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if let Some(status) = err.status() {
            Self::HttpStatus {
                status: status.as_u16(),
                url,
            }
        } else {
            Self::network(url, err)
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LoadError::Timeout { .. } => true,
            LoadError::Network { .. } => true,
            LoadError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            LoadError::InvalidContent { .. } => false,
            LoadError::Aborted => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LoadError::Timeout { .. })
    }
}

/// Failure reported by a playback sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("{stream} buffer is full")]
    QuotaExceeded { stream: StreamType },

    #[error("append to {stream} buffer failed: {reason}")]
    Append { stream: StreamType, reason: String },

    #[error("remove from {stream} buffer failed: {reason}")]
    Remove { stream: StreamType, reason: String },

    #[error("no {stream} buffer exists")]
    MissingBuffer { stream: StreamType },

    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SinkError::QuotaExceeded { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("transmux error: {0}")]
    Transmux(#[from] TransmuxError),

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("fatal {details} error: {reason}")]
    Fatal { details: ErrorDetails, reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("session cancelled")]
    Cancelled,
}

impl CascadeError {
    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

impl From<&ErrorEvent> for CascadeError {
    fn from(event: &ErrorEvent) -> Self {
        CascadeError::Fatal {
            details: event.details,
            reason: event.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Media,
    Key,
    Mux,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDetails {
    ManifestLoadError,
    FragLoadError,
    FragLoadTimeout,
    KeyLoadError,
    KeyLoadTimeout,
    FragParsingError,
    BufferFullError,
    BufferAppendError,
    BufferAppendingError,
    InternalException,
}

impl ErrorDetails {
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorDetails::ManifestLoadError
            | ErrorDetails::FragLoadError
            | ErrorDetails::FragLoadTimeout => ErrorKind::Network,
            ErrorDetails::KeyLoadError | ErrorDetails::KeyLoadTimeout => ErrorKind::Key,
            ErrorDetails::FragParsingError => ErrorKind::Mux,
            ErrorDetails::BufferFullError
            | ErrorDetails::BufferAppendError
            | ErrorDetails::BufferAppendingError => ErrorKind::Media,
            ErrorDetails::InternalException => ErrorKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorDetails::ManifestLoadError => "manifestLoadError",
            ErrorDetails::FragLoadError => "fragLoadError",
            ErrorDetails::FragLoadTimeout => "fragLoadTimeOut",
            ErrorDetails::KeyLoadError => "keyLoadError",
            ErrorDetails::KeyLoadTimeout => "keyLoadTimeOut",
            ErrorDetails::FragParsingError => "fragParsingError",
            ErrorDetails::BufferFullError => "bufferFullError",
            ErrorDetails::BufferAppendError => "bufferAppendError",
            ErrorDetails::BufferAppendingError => "bufferAppendingError",
            ErrorDetails::InternalException => "internalException",
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error signal delivered to schedulers and to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub details: ErrorDetails,
    pub fatal: bool,
    /// Scheduler the error originates from, if any.
    pub parent: Option<PlaylistType>,
    pub frag: Option<Fragment>,
    pub reason: String,
}

impl ErrorEvent {
    pub fn new(details: ErrorDetails, fatal: bool, reason: impl Into<String>) -> Self {
        Self {
            kind: details.kind(),
            details,
            fatal,
            parent: None,
            frag: None,
            reason: reason.into(),
        }
    }

    pub fn with_parent(mut self, parent: PlaylistType) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_frag(mut self, frag: &Fragment) -> Self {
        self.parent.get_or_insert(frag.kind);
        self.frag = Some(frag.clone());
        self
    }

    /// Whether this error concerns the scheduler of `kind`.
    pub fn concerns(&self, kind: PlaylistType) -> bool {
        let frag_kind = self.frag.as_ref().map(|f| f.kind);
        frag_kind.or(self.parent).is_none_or(|k| k == kind)
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}: {}",
            if self.fatal { "fatal " } else { "" },
            self.details,
            self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_retryable() {
        assert!(LoadError::Timeout { url: "u".into() }.is_retryable());
        assert!(
            LoadError::HttpStatus {
                status: 503,
                url: "u".into()
            }
            .is_retryable()
        );
        assert!(
            !LoadError::HttpStatus {
                status: 404,
                url: "u".into()
            }
            .is_retryable()
        );
        assert!(!LoadError::Aborted.is_retryable());
    }

    #[test]
    fn test_error_event_routing() {
        let frag = Fragment::new(PlaylistType::Audio, 0, 3, 0.0, 4.0);
        let event = ErrorEvent::new(ErrorDetails::FragLoadError, false, "boom").with_frag(&frag);
        assert_eq!(event.kind, ErrorKind::Network);
        assert!(event.concerns(PlaylistType::Audio));
        assert!(!event.concerns(PlaylistType::Main));

        let global = ErrorEvent::new(ErrorDetails::InternalException, false, "oops");
        assert!(global.concerns(PlaylistType::Main));
        assert_eq!(global.to_string(), "internalException: oops");
    }
}
