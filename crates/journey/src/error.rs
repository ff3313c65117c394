use thiserror::Error;

pub type JourneyResult<T> = Result<T, JourneyError>;

#[derive(Error, Debug)]
pub enum JourneyError {
    /// Malformed campaign or expression. The campaign is skipped.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{port} port failure: {message}")]
    Port { port: &'static str, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Journey orchestrator is not running")]
    NotRunning,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JourneyError {
    pub fn port(port: &'static str, err: PortError) -> Self {
        JourneyError::Port {
            port,
            message: err.to_string(),
        }
    }
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// No surface is currently able to present content.
    #[error("no eligible presentation surface")]
    NoSurface,

    #[error("content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("{0}")]
    Failed(String),
}

pub type PortResult<T> = Result<T, PortError>;
