use thiserror::Error;

/// Error taxonomy for scheduler operations.
///
/// Cache failures never appear here: the cache layer recovers locally
/// (log + fallback to the durable store). Store failures are fatal to the
/// single operation that hit them; the caller retries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("dependency degraded: {0}")]
    DegradedDependency(String),
    #[error("store error: {0}")]
    Store(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
