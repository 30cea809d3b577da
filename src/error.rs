//! Error types for the node.

use thiserror::Error;

/// Framing violations detected while decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A frame carried a zero-length command name.
    #[error("frame has an empty command")]
    EmptyCommand,

    /// Command name exceeds the allowed length.
    #[error("command length {0} exceeds limit")]
    CommandTooLong(usize),

    /// Body exceeds the allowed length.
    #[error("body length {0} exceeds limit")]
    BodyTooLarge(usize),

    /// Stream ended in the middle of a frame.
    #[error("stream ended mid-frame")]
    Truncated,
}

/// Main error type for node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on the wire.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// JSON encode/decode error for service descriptors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using NodeError.
pub type Result<T> = std::result::Result<T, NodeError>;
