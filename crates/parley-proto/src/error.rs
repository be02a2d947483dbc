//! Codec error types.

use thiserror::Error;

/// Errors raised by the framing codec.
///
/// `FrameTooLarge` and `Io` are unrecoverable for the stream: the length
/// prefix can no longer be trusted and the connection must be closed.
/// `BadPayload` consumes exactly one frame and the stream stays usable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket or buffer I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix exceeds [`crate::MAX_FRAME_LEN`].
    #[error("frame too large: {size} bytes (max 16 MiB)")]
    FrameTooLarge {
        /// Declared payload length.
        size: usize,
    },

    /// A complete frame carried JSON that does not decode to a message.
    #[error("bad frame payload: {0}")]
    BadPayload(#[source] serde_json::Error),

    /// Peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Whether the stream can continue after this error.
    ///
    /// Only a bad payload is local to one frame; everything else poisons
    /// the framing state.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::BadPayload(_))
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
