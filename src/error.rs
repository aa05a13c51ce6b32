//! Engine error taxonomy.
//!
//! One enum covering validation failures, storage failures, transport
//! failures and throttling denials — everything that can bubble out of the
//! public `Engine` API. Internal helpers mostly return `anyhow::Result` and
//! get converted at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("request not found: {0}")]
    NotFound(String),

    #[error("request already exists: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage migration error: {0}")]
    Migration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("circuit open for host {host}, retry after {retry_after_ms}ms")]
    CircuitOpen { host: String, retry_after_ms: u64 },

    #[error("rate limited for host {host}, retry after {retry_after_ms}ms")]
    RateLimited { host: String, retry_after_ms: u64 },

    #[error("concurrency limit reached for host {host} (limit {limit})")]
    ConcurrencyLimit { host: String, limit: u32 },

    #[error("engine is paused")]
    Paused,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(0)
        } else {
            EngineError::Transport(e.to_string())
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
