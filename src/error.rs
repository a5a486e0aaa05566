//! Error taxonomy shared by the node and coordinator sides
//!
//! Each enum maps to one failure class with its own propagation rule:
//!
//! - [`ProtocolError`]: a single message is dropped, the connection stays open
//! - [`ConfigurationError`]: surfaced synchronously at registration time
//! - [`ConnectionError`]: ends the affected connection only
//! - [`NotificationError`]: isolated per provider, never leaves `Notifier::notify`
//! - [`CoordinatorError`]: lifecycle and routing failures of the coordinator itself

use std::time::Duration;

/// A message could not be decoded or encoded
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or lacks envelope fields
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The `kind` discriminator is not one we know
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    /// The payload does not have the shape required by its kind
    #[error("invalid payload for {kind}: {reason}")]
    PayloadShape { kind: String, reason: String },

    /// Serialization of an outgoing message failed
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A threshold rule or configuration value was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("unsupported threshold operator '{0}' (expected one of <, >, ==)")]
    UnsupportedOperator(String),

    #[error("unknown alert level '{0}' (expected info, warning or critical)")]
    UnknownLevel(String),

    #[error("invalid threshold rule: {0}")]
    InvalidRule(String),

    #[error("threshold rule '{0}' is already registered")]
    DuplicateRule(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The peer went away or the byte stream is unusable
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// EOF arrived in the middle of a frame
    #[error("connection closed by peer mid-frame ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    /// A write was abandoned because the connection is shutting down
    #[error("write interrupted by shutdown")]
    Interrupted,

    #[error("could not reach {addr} after {attempts} attempts")]
    Unreachable { addr: String, attempts: u32 },

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Delivery through a single provider failed
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} answered with status {status}")]
    Status { provider: String, status: u16 },

    #[error("{provider} did not answer within {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("{0} panicked while sending")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Coordinator lifecycle and routing failures
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("node '{0}' is not connected")]
    UnknownNode(String),

    #[error("connection of node '{0}' is closed")]
    ConnectionClosed(String),

    #[error("node '{node}' did not answer the query within {timeout:?}")]
    QueryTimeout { node: String, timeout: Duration },

    #[error("the sweep task is not running")]
    SweepStopped,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
