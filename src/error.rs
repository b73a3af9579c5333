use thiserror::Error;

/// Failures talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store unavailable")]
    Unavailable,
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("invalid config field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CoordError>;
