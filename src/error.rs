use thiserror::Error;

use crate::protocol::{DecodeError, EncodeError};

/// Errors that can occur during RPC operations.
///
/// Application failures (`UnknownMethod`, `Handler`) travel back to the
/// caller as data inside a reply envelope and are only turned into this type
/// on the client side.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Malformed or truncated envelope. Permanent for the message it came from.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An envelope could not be encoded (a field exceeded its wire limit).
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// The server has no handler registered for the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The handler ran and reported an application error.
    #[error("handler error: {0}")]
    Handler(String),

    /// No reply arrived before the call deadline.
    #[error("request timed out")]
    Timeout,

    /// Lifecycle shutdown interrupted the call or dispatch.
    #[error("operation cancelled")]
    Cancelled,

    /// The discovery collaborator failed to resolve broker endpoints.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Connecting a producer or consumer to an endpoint failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// Publish or other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization of a typed payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required configuration value is missing or unparsable.
    #[error("missing or invalid config: {0}")]
    MissingConfig(String),

    /// Mutually exclusive configuration options were combined.
    #[error("config conflict: {0}")]
    ConfigConflict(String),

    /// Installing the shutdown signal handlers failed.
    #[error("signal handler error: {0}")]
    Signal(#[source] std::io::Error),
}

impl RpcError {
    /// True for failures produced by the remote application rather than by
    /// the RPC layer or the transport.
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::UnknownMethod(_) | RpcError::Handler(_))
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
