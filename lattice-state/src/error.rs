//! Error types.
//!
//! Each layer has its own error enum: the reactive engine, the wire
//! protocol, the socket transport and configuration loading. Validation
//! rejections are not errors; they surface as [`SyncEvent::Rejected`].
//!
//! [`SyncEvent::Rejected`]: crate::sync::SyncEvent::Rejected

use std::path::PathBuf;

use thiserror::Error;

use crate::graph::NodeId;

/// Failures raised by the reactive engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A computed or effect function panicked or returned an error.
    #[error("evaluation of node {node} failed: {message}")]
    Evaluation { node: NodeId, message: String },

    /// A computed read itself, directly or through other computeds.
    #[error("dependency cycle detected at node {node}")]
    Cycle { node: NodeId },

    /// Effects kept writing to their own inputs.
    #[error("flush did not settle after {rounds} rounds")]
    FlushLimit { rounds: usize },

    /// The node was disposed.
    #[error("node {node} has been disposed")]
    Disposed { node: NodeId },
}

/// A malformed or unexpected envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("unexpected `{kind}` envelope from {origin}")]
    UnexpectedEnvelope { kind: &'static str, origin: &'static str },
}

/// Socket-level failures. These trigger reconnect-and-resync on the client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
