/// error taxonomy for the cache pipeline
///
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// the backing store could not be reached; fatal to the store connector
    #[error("connection error: {0}")]
    Connection(String),

    /// raised by a SimulateFailure command; fatal to the receiving worker
    #[error("injected failure in {0}")]
    InjectedFailure(String),

    /// a caller-side request/reply exchange did not complete in time
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// a mailbox or reply channel closed before the exchange completed
    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("restart limit exceeded for {0}")]
    RestartLimitExceeded(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
