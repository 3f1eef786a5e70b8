//! Feed error types

use nostr_client::{ClientError, ConfigError};
use thiserror::Error;

/// Errors raised by feed sources and the feed service.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, FeedError>;
