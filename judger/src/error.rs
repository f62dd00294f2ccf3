//! Error taxonomy for the judging core's adapters, composed into a
//! single top-level error at the processor boundary via `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Transient failures are the only kind worth retrying within the
    /// task (§7: "retried within the task with bounded attempts").
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("produce failed: {0}")]
    Produce(String),
    #[error("payload decode failed: {0}")]
    Decode(String),
}
