use thiserror::Error;

use everstore_storage::StorageError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Index(#[from] everstore_index::IndexError),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    FanOut(#[from] FanOutError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn embedding<E: std::fmt::Display>(e: E) -> Self {
        Self::Embedding(e.to_string())
    }
}

/// One subscriber's failure during event fan-out.
#[derive(Debug, Clone)]
pub struct SubscriberFailure {
    pub subscription_id: u64,
    pub error: String,
}

/// Delivered to the publisher when one or more subscribers failed. The
/// persisted event is not rolled back.
#[derive(Debug, Error)]
#[error("event fan-out failed for {} subscriber(s)", failures.len())]
pub struct FanOutError {
    pub event_id: String,
    pub failures: Vec<SubscriberFailure>,
}
