use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Inbound payload was not a telemetry object.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Store unreachable, locked past the busy timeout, or a statement failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// AI report generator or notifier failed or timed out.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

/// Request URLs can carry credentials, so they are dropped from the message.
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Collaborator(e.without_url().to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Collaborator("timed out".to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
