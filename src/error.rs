use thiserror::Error;

/// Errors raised by the pipeline components.
///
/// Staging tasks convert every variant into a recorded failure at the task
/// boundary; only configuration problems escape to the CLI.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or HTTP failure talking to the remote data API.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote API answered with an error payload or an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("merge error: {0}")]
    Merge(String),

    #[error("refresh error: {0}")]
    Refresh(String),

    #[error("failed to decode record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("task timed out after {0}s")]
    Timeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
