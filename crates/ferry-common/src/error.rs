//! Common error types for Ferry.

use thiserror::Error;

/// Result type alias using Ferry's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Ferry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Description apply or answer creation rejected by the transport
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Origin not approved and approval declined or unavailable
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// A second request arrived while one is already active
    #[error("relay busy: {0}")]
    Contention(String),

    /// Source stream errored or channel closed mid-transfer
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Request discarded because its owning endpoint went away
    #[error("stale request: {0}")]
    StaleRequest(String),

    /// The other end of a message port is gone
    #[error("port closed: {0}")]
    PortClosed(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create an authorization error from any displayable type.
    pub fn denied(msg: impl std::fmt::Display) -> Self {
        Self::AuthorizationDenied(msg.to_string())
    }

    /// Create a contention error from any displayable type.
    pub fn contention(msg: impl std::fmt::Display) -> Self {
        Self::Contention(msg.to_string())
    }

    /// Create a transfer error from any displayable type.
    pub fn transfer(msg: impl std::fmt::Display) -> Self {
        Self::Transfer(msg.to_string())
    }

    /// Create a stale request error from any displayable type.
    pub fn stale(msg: impl std::fmt::Display) -> Self {
        Self::StaleRequest(msg.to_string())
    }

    /// Create a port closed error from any displayable type.
    pub fn port_closed(msg: impl std::fmt::Display) -> Self {
        Self::PortClosed(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
