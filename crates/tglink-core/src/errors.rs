//! Error taxonomy for the transport core.
//!
//! Every failure a caller can observe maps onto one [`LinkError`] variant.
//! Errors born on the streaming task are never raised across threads; the
//! subscriber converts them into events and the variants here only surface
//! from calls made on the caller's own task.

use thiserror::Error;

/// Frame codec failures. Decoding a buffer whose header claims compression
/// but whose body does not match is a corruption signal, not a soft error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Decompressed size disagrees with the length recorded in the header.
    #[error("frame length mismatch: header says {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Length stored in the frame header.
        expected: usize,
        /// Length actually produced by decompression.
        actual: usize,
    },

    /// The compressed body could not be inflated.
    #[error("corrupt compressed frame: {0}")]
    Corrupt(String),
}

/// Top-level error type for all transport operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Operation attempted with no open transport.
    #[error("not connected to server")]
    NotConnected,

    /// I/O failure that exhausted its retry budget. The transport is left
    /// closed and must be explicitly reopened.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed or unparseable reply from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the server inside a well-formed reply.
    #[error("server error {code}: {message}")]
    Server {
        /// Numeric JSON-RPC error code.
        code: i64,
        /// Human-readable message from the server.
        message: String,
    },

    /// The server stayed busy for the whole async-job retry window.
    #[error("server busy: {0}")]
    ServerBusy(String),

    /// An async job did not complete within the polling budget.
    #[error("async job timeout: {0}")]
    Timeout(String),

    /// No barrier acknowledgment arrived on the streaming channel in time.
    #[error("barrier timeout: {0}")]
    BarrierTimeout(String),

    /// The server rejected the protocol/version handshake.
    #[error("API version mismatch: {0}")]
    VersionMismatch(String),

    /// Compression envelope failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A blocking operation was cancelled via the session cancel token.
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl LinkError {
    /// True when the error indicates the transport had to be closed.
    pub fn closed_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_) | LinkError::NotConnected)
    }
}
