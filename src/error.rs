use thiserror::Error;

/// Failures raised by a [`CounterStore`](crate::store::CounterStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the store's default timeout.
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    /// A key holds a value of a different shape than the command expects.
    #[error("wrong value type at key '{0}'")]
    WrongType(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Crate-level error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored value could not be parsed. Readers treat it as empty.
    #[error("malformed value at '{key}': {reason}")]
    MalformedValue { key: String, reason: String },

    /// Invalid setup (limiter window/threshold, env var). Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;
