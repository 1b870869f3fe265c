//! Error types for opsmux.

use thiserror::Error;

use crate::types::ProviderStatus;

/// Main error type for opsmux operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure (spawn, I/O, stream).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider connection went away while a request was in flight.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The provider answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// A request or connection attempt exceeded its deadline.
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// No provider is registered under the routed id.
    #[error("Provider {0} not found")]
    ProviderNotFound(String),

    /// The provider exists but cannot serve calls right now.
    #[error("Provider {provider} not available (status: {status})")]
    ProviderUnavailable {
        provider: String,
        status: ProviderStatus,
    },

    /// A queued request expired before the provider came back.
    #[error(
        "Queued request for provider {provider} timed out after {timeout_ms}ms waiting for the provider to become available"
    )]
    QueueTimeout { provider: String, timeout_ms: u64 },

    /// A queued request was rejected during provider teardown.
    #[error("{0}")]
    QueueRejected(String),

    /// Recognized but unimplemented feature.
    #[error("{0} is not yet implemented")]
    NotImplemented(String),

    /// Authentication failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed data received from a provider.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    /// Whether this error reports a queue expiry rather than a failed call.
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Error::QueueTimeout { .. })
    }
}

/// Result type alias for opsmux operations.
pub type Result<T> = std::result::Result<T, Error>;
