use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint in {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("checkpoint store lock poisoned")]
    Poisoned,

    #[error("checkpoint write rejected: {0}")]
    Rejected(String),
}

pub type StateResult<T> = Result<T, StateError>;
