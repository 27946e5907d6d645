//! Error types for coreipc.

use std::io;

/// Transport operation errors.
///
/// Every variant is recoverable and is returned to the immediate caller;
/// none of them terminates the process. [`Error::ShortTransfer`] and
/// [`Error::InvalidRelease`] indicate protocol or memory-safety violations
/// and are additionally reported on the diagnostic channel (`tracing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A domain, node or port field is outside the configured range.
    InvalidAddress,
    /// The endpoint handle was never registered or has been torn down.
    UnknownEndpoint,
    /// No free slot exists in the fixed table.
    PoolExhausted,
    /// Unrecognized channel kind code.
    InvalidKind,
    /// Session index out of range or slot is free.
    SessionNotFound,
    /// The session has already left the Created state.
    AlreadyConnected,
    /// The requested channel kind disagrees with the slot's recorded kind.
    KindMismatch,
    /// The session is not in the Connected state.
    SessionNotConnected,
    /// Payload exceeds the configured maximum transfer length.
    PayloadTooLarge,
    /// The caller-supplied buffer cannot hold the arriving message.
    /// `needed` is the arriving size; the message stays queued so the
    /// caller can retry with a larger buffer.
    BufferTooSmall { needed: usize },
    /// Declared and received lengths disagree; protocol fault.
    ShortTransfer { declared: usize, received: usize },
    /// A supplied deadline elapsed before the operation completed.
    Timeout,
    /// No session slot owns the local endpoint's port.
    PortNotBound,
    /// The resolved slot index exceeds the pool's addressable range.
    SlotRangeExceeded,
    /// The underlying allocator cannot satisfy the request.
    OutOfMemory,
    /// Release of an unknown or already-released uncached buffer.
    InvalidRelease,
    /// Unmapped transport-level failure carrying the underlying code.
    TransportFailure { code: i32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidAddress => write!(f, "address field out of range"),
            Error::UnknownEndpoint => write!(f, "unknown endpoint handle"),
            Error::PoolExhausted => write!(f, "no free slot in the fixed table"),
            Error::InvalidKind => write!(f, "unrecognized channel kind"),
            Error::SessionNotFound => write!(f, "session not found"),
            Error::AlreadyConnected => write!(f, "session already connected"),
            Error::KindMismatch => write!(f, "channel kind mismatch"),
            Error::SessionNotConnected => write!(f, "session not connected"),
            Error::PayloadTooLarge => write!(f, "payload exceeds maximum transfer length"),
            Error::BufferTooSmall { needed } => {
                write!(f, "buffer too small, message needs {} bytes", needed)
            }
            Error::ShortTransfer { declared, received } => write!(
                f,
                "short transfer: declared {} bytes, received {}",
                declared, received
            ),
            Error::Timeout => write!(f, "operation timed out"),
            Error::PortNotBound => write!(f, "no session owns the local port"),
            Error::SlotRangeExceeded => write!(f, "slot index exceeds pool range"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::InvalidRelease => write!(f, "release of unknown or freed buffer"),
            Error::TransportFailure { code } => write!(f, "transport failure (code {})", code),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::TransportFailure {
                code: e.raw_os_error().unwrap_or(-1),
            },
        }
    }
}

/// Result type for coreipc operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        assert_eq!(
            Error::from(io::Error::from(io::ErrorKind::TimedOut)),
            Error::Timeout
        );
        assert_eq!(
            Error::from(io::Error::from(io::ErrorKind::WouldBlock)),
            Error::Timeout
        );
        assert_eq!(
            Error::from(io::Error::from(io::ErrorKind::OutOfMemory)),
            Error::OutOfMemory
        );
    }

    #[test]
    fn test_io_error_preserves_os_code() {
        assert_eq!(
            Error::from(io::Error::from_raw_os_error(9999)),
            Error::TransportFailure { code: 9999 }
        );
        // No OS code available: the sentinel is carried instead.
        assert_eq!(
            Error::from(io::Error::other("mapping failed")),
            Error::TransportFailure { code: -1 }
        );
    }
}
