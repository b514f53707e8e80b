//! Error types for the hrpc runtime.
//!
//! Every failure a caller can observe is one variant of [`RpcError`]. The
//! five kinds callers are expected to branch on are `ServiceUnavailable`,
//! `Registration`, `Connection`, `Timeout` and `Remote`; the rest describe
//! faults in the collaborators underneath them.

use crate::message::RemoteFault;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the hrpc runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    // Discovery errors
    #[error("No available address for service {service}")]
    ServiceUnavailable { service: String },

    #[error("Failed to register {service} at {address}: {message}")]
    Registration {
        service: String,
        address: String,
        message: String,
    },

    // Coordination service errors
    #[error("Coordination error at {path}: {message}")]
    Coordination { path: String, message: String },

    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    // Transport errors
    #[error("Connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: u64, after: Duration },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Transport is shut down")]
    Shutdown,

    // Remote execution errors
    #[error("Remote exception: {0}")]
    Remote(RemoteFault),

    // Serialization errors
    #[error("Serialization error ({format}): {message}")]
    Serialization {
        format: &'static str,
        message: String,
    },

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for hrpc operations.
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
        RpcError::Serialization {
            format: "json",
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Serialization {
            format: "msgpack",
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Serialization {
            format: "msgpack",
            message: err.to_string(),
        }
    }
}

impl From<RemoteFault> for RpcError {
    fn from(fault: RemoteFault) -> Self {
        RpcError::Remote(fault)
    }
}

impl RpcError {
    /// Create a connection error for `address`.
    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a coordination error for `path`.
    pub fn coordination(path: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Coordination {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if the failed call could reasonably be tried again.
    ///
    /// The runtime itself never retries; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Connection { .. } | RpcError::Timeout { .. })
    }

    /// True for failures raised by the transport rather than by the remote
    /// implementation or by discovery.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            RpcError::Connection { .. }
                | RpcError::Timeout { .. }
                | RpcError::Protocol { .. }
                | RpcError::Shutdown
        )
    }
}
