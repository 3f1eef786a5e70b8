//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame could not be decoded
    #[error("Message error: {0}")]
    Message(#[from] crate::message::MessageError),

    /// Invalid client configuration
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Event model error (id hashing, signer replies)
    #[error("Event error: {0}")]
    Event(#[from] nostr_core::EventError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Already connected or connecting
    #[error("Already connected to relay")]
    AlreadyConnected,

    /// No relay accepted the event
    #[error("Event publish failed: {0}")]
    PublishFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
