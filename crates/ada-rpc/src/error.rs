//! Error types for the Ada RPC layer.
//!
//! Errors fall into two groups. Transport-level errors (`Transport`, `Auth`,
//! `Protocol` and the I/O conversions) propagate to whoever called `open`,
//! `send`, `recv` or `call`. Dispatch-time errors (`HandlerNotFound`,
//! `InvalidArguments`, `Handler`) are caught at the server boundary and turned
//! into a failed `Response` for the remote caller.

use thiserror::Error;

/// Main error type for the RPC subsystem.
#[derive(Debug, Error)]
pub enum RpcError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Dispatch errors
    #[error("HandlerNotFound: no handler found for {endpoint}")]
    HandlerNotFound { endpoint: String },

    #[error("{message}")]
    InvalidArguments { message: String },

    #[error("{message}")]
    Handler { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
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
    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        RpcError::Auth {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RpcError::Config {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the transport layer and must reach the
    /// caller, as opposed to a dispatch error reported inside a `Response`.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. } | RpcError::Auth { .. } | RpcError::Protocol { .. }
        )
    }
}
