use std::time::Duration;

use refine_core::errors::UpstreamError;
use refine_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not retryable: {0}")]
    NotRetryable(String),

    #[error("session stopped")]
    Stopped,

    #[error("stage timeout after {0:?}")]
    StageTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}
