//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No complete message could be assembled from inbound data.
    #[error("Invalid JSON RPC response: {reason} ({discarded:?})")]
    Framing { reason: String, discarded: String },

    /// `send` was called while the connection is disconnected or closing.
    #[error("connection not open on send()")]
    NotConnected,

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The connection closed for good while the request was queued or in flight.
    #[error("Connection closed (code {code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Connection error: Timeout exceeded ({ms}ms)")]
    Timeout { ms: u64 },

    /// The outbound payload cannot be sent (no usable id, duplicate id, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The connection options are unusable (bad URL, bad header).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pending work was discarded by an explicit reset.
    #[error("Request discarded by transport reset")]
    Reset,

    /// The client was dropped and its background task has stopped.
    #[error("Transport shut down")]
    Shutdown,

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Timeout { .. }
                | Self::NotConnected
                | Self::ConnectionClosed { .. }
        )
    }

    /// Returns `true` if this is a node-side execution error (not retryable).
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Build a framing error for data that had to be discarded.
    pub fn framing(reason: impl Into<String>, discarded: impl Into<String>) -> Self {
        Self::Framing {
            reason: reason.into(),
            discarded: discarded.into(),
        }
    }
}
