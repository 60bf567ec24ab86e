//! Error types for protocol engine operations

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{error_codes, message::RpcError};

/// Protocol engine error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire bytes; the offending frame is dropped, the session survives
    #[error("Decode error: {0}")]
    Decode(String),

    /// State or sequencing violation (duplicate id, message outside its legal state)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O-level transport failure; fatal to the session
    #[error("Transport error: {0}")]
    Transport(String),

    /// The channel closed underneath an operation
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A gated method was invoked without the capability in the negotiated set
    #[error("Capability not negotiated: {0}")]
    CapabilityNotNegotiated(String),

    /// Handshake version check failed; fatal to the session
    #[error("Protocol version mismatch: peer offered {offered}, supported: {supported}")]
    VersionMismatch { offered: String, supported: String },

    /// Non-handshake traffic before the handshake completed
    #[error("Session not initialized")]
    NotInitialized,

    /// New outbound work refused while the session drains
    #[error("Session shutting down")]
    ShuttingDown,

    /// Caller-specified deadline elapsed; the request was cancelled on expiry
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    /// The request was cancelled before a response arrived
    #[error("Request cancelled")]
    Cancelled,

    /// Bounded outbound queue is full; the send was rejected, not queued
    #[error("Outbound queue full")]
    Backpressure,

    /// The peer answered with an error response
    #[error("Peer returned error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Map an engine error onto the wire error object sent back to the peer.
    ///
    /// Only errors that are legal as a response to a single request map here;
    /// transport-level failures never become responses.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Error::Decode(msg) => RpcError::new(error_codes::PARSE_ERROR, msg),
            Error::Protocol(msg) => RpcError::new(error_codes::INVALID_REQUEST, msg),
            Error::CapabilityNotNegotiated(cap) => RpcError::new(
                error_codes::CAPABILITY_NOT_NEGOTIATED,
                &format!("Capability '{}' was not negotiated for this session", cap),
            ),
            Error::VersionMismatch { offered, supported } => RpcError::new(
                error_codes::VERSION_MISMATCH,
                &format!(
                    "Unsupported protocol version {} (supported: {})",
                    offered, supported
                ),
            ),
            Error::NotInitialized => RpcError::new(
                error_codes::NOT_INITIALIZED,
                "Session has not completed initialization",
            ),
            Error::ShuttingDown => RpcError::new(
                error_codes::SHUTTING_DOWN,
                "Session is shutting down and no longer accepts requests",
            ),
            Error::Cancelled => {
                RpcError::new(error_codes::REQUEST_CANCELLED, "Request was cancelled")
            }
            Error::Rpc(err) => err.clone(),
            Error::Serialization(e) => {
                RpcError::new(error_codes::INVALID_PARAMS, &e.to_string())
            }
            other => RpcError::new(error_codes::INTERNAL_ERROR, &other.to_string()),
        }
    }

    /// Whether this error tears down the whole session rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionClosed(_) | Error::VersionMismatch { .. }
        )
    }
}

/// Convenience result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
