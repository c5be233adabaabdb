//! Error types for the Pylon RPC runtime.
//!
//! Every failure a caller can observe from a call, and every failure the
//! transport reacts to internally, is a variant of [`RpcError`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the RPC runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    // Liveness errors
    #[error("rpc peer [{peer}] connection not active")]
    ConnectionNotActive { peer: String },

    #[error("rpc endpoint stopped")]
    Stopped,

    // Service errors
    #[error("no service [{0}]")]
    ServiceNotFound(String),

    #[error("{message}")]
    Handler { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    // Wire errors
    #[error("Failed to decode response: {message}")]
    Decode { message: String },

    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    pub fn not_active(peer: impl Into<String>) -> Self {
        RpcError::ConnectionNotActive { peer: peer.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Whether the failure is a transport-level one that the reconnect
    /// machinery recovers from, as opposed to an application-level failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionNotActive { .. }
                | RpcError::Protocol { .. }
                | RpcError::ReadTimeout(_)
                | RpcError::Io { .. }
        )
    }
}
