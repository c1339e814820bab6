//! Protocol-level error types

use thiserror::Error;

/// Errors produced while decoding or encoding USB/IP wire data.
///
/// Every variant here is fatal to the connection that produced it: per the
/// wire protocol, there is no partial-recovery path from a malformed
/// preamble, a short read, or an unrecognized op/command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Preamble carried a version other than `USBIP_VERSION`.
    #[error("unsupported USB/IP version {0:#06x}")]
    UnsupportedVersion(u16),

    /// Preamble or header carried an op/command code we don't recognize.
    #[error("unknown op code {0:#06x}")]
    UnknownOp(u16),

    /// Header carried a command code outside {SUBMIT, RET_SUBMIT, UNLINK, RET_UNLINK}.
    #[error("unknown URB command {0:#010x}")]
    UnknownCommand(u32),

    /// Peer replied with a non-OK status where one was expected.
    #[error("peer reported non-OK status {0}")]
    PeerStatus(i32),

    /// A fixed-length read did not return enough bytes before EOF.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Underlying I/O failure reading or writing the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
