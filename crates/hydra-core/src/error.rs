use thiserror::Error;

/// Errors produced by the hydra relay layer.
#[derive(Debug, Error)]
pub enum HydraError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("admission refused: {0}")]
    Admission(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for HydraError {
    fn from(e: serde_json::Error) -> Self {
        HydraError::Protocol(e.to_string())
    }
}

pub type HydraResult<T> = Result<T, HydraError>;
