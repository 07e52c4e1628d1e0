//! Error types for framewire.

use thiserror::Error;

use crate::transport::Fault;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (malformed frame, inconsistent sizes, illegal flags).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request id was reused while an earlier request with the same id is outstanding.
    #[error("Duplicate outstanding request id: {0}")]
    DuplicateRequest(i64),

    /// A response arrived for a request id that has no pending entry.
    #[error("No such request: {0}")]
    UnknownRequest(i64),

    /// A single outbound message is larger than the frame budget.
    #[error("Buffer overflow: message of {size} bytes exceeds max frame size {max}")]
    FrameOverflow { size: usize, max: usize },

    /// An inbound message can never fit into the configured response buffer.
    #[error("Response buffer too small: message needs {required} bytes, buffer holds {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    /// The peer (or the local side) rejected a request with a typed fault.
    #[error("Fault raised for request {}", .0.request_id())]
    Fault(Fault),

    /// The operation was cancelled by a cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection closed or failed underneath a pending operation.
    #[error("Connection closed")]
    ConnectionClosed,

    /// `open()` was called on a session that is not freshly created.
    #[error("Session already opened")]
    AlreadyOpened,

    /// The session is not open.
    #[error("Session is not open")]
    NotOpen,
}

impl FramewireError {
    /// Whether this error came from a cancellation token rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FramewireError::Cancelled)
    }
}

impl From<FramewireError> for std::io::Error {
    fn from(err: FramewireError) -> Self {
        use std::io::ErrorKind;

        match err {
            FramewireError::Io(e) => e,
            FramewireError::ConnectionClosed => ErrorKind::BrokenPipe.into(),
            other @ FramewireError::Cancelled => std::io::Error::new(ErrorKind::Interrupted, other),
            other => std::io::Error::new(ErrorKind::Other, other),
        }
    }
}

/// Why a session or multiplexing factory was torn down.
///
/// Recorded once at teardown and used to fail every pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The shared cancellation token fired or `close()` was called.
    Cancelled,
    /// A fault was raised locally or received from the peer.
    Faulted,
    /// The byte stream reached EOF or failed.
    ConnectionClosed,
    /// The peer violated the protocol.
    ProtocolViolation,
}

impl CloseReason {
    /// Reason recorded when `err` stops a pump.
    pub fn from_error(err: &FramewireError) -> Self {
        match err {
            FramewireError::Cancelled => CloseReason::Cancelled,
            FramewireError::Fault(_) => CloseReason::Faulted,
            FramewireError::Io(_) | FramewireError::ConnectionClosed => CloseReason::ConnectionClosed,
            _ => CloseReason::ProtocolViolation,
        }
    }

    /// The error surfaced to operations that were pending at teardown.
    pub fn to_error(self) -> FramewireError {
        match self {
            CloseReason::Cancelled | CloseReason::Faulted => FramewireError::Cancelled,
            CloseReason::ConnectionClosed | CloseReason::ProtocolViolation => {
                FramewireError::ConnectionClosed
            }
        }
    }
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;
