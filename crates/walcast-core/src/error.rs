use thiserror::Error;

/// Errors that can occur in walcast-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream source error: {0}")]
    Source(String),

    #[error("upstream source is closed")]
    SourceClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
