use cascade_engine::CascadeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] CascadeError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl CliError {
    /// Process exit status for the error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Logging(_) => 2,
            CliError::Session(CascadeError::Load(_) | CascadeError::Manifest { .. }) => 3,
            CliError::Session(CascadeError::Fatal { .. }) => 4,
            CliError::Io(_) | CliError::Session(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_engine::{ErrorDetails, LoadError};

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            CliError::from(CascadeError::Load(LoadError::Aborted)).exit_code(),
            3
        );
        assert_eq!(
            CliError::from(CascadeError::Fatal {
                details: ErrorDetails::FragLoadError,
                reason: "gone".into(),
            })
            .exit_code(),
            4
        );
        assert_eq!(CliError::from(CascadeError::internal("x")).exit_code(), 1);
    }
}
