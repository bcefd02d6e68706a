use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("unknown provider: {name}")]
    UnknownProvider { name: String },
    #[error("request not found: {id}")]
    NotFound { id: String },
    #[error("request already in a terminal state: {id}")]
    TerminalConflict { id: String },
    #[error("rate limit exceeded, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },
    #[error("request queue is full")]
    QueueFull,
    #[error("missing or invalid api key")]
    Unauthorized,
    #[error("wait timed out before the request reached a terminal state")]
    WaitTimeout,
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
