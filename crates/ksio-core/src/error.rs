//! Error types for ksio
//!
//! Every failure that can reach a pipe or registration user is a
//! [`KsioError`]. It is `Clone` so a single terminal cause can be handed to
//! every pending and future operation of a cancelled pipe.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::interest::Interest;

/// Result type for ksio operations
pub type Result<T> = std::result::Result<T, KsioError>;

/// Why an operation was cancelled.
///
/// Cancellation is a terminal cause but not an error of the peer or the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The owning selector (or transport) was shut down.
    Shutdown,
    /// A deadline raced against the operation fired first.
    Timeout,
    /// The descriptor or pipe was closed underneath the operation.
    Closed,
    /// Cancelled explicitly by the user.
    Aborted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "shutdown"),
            CancelReason::Timeout => write!(f, "timed out"),
            CancelReason::Closed => write!(f, "closed"),
            CancelReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// The pipe end an operation was issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeOp {
    Read,
    Write,
}

impl fmt::Display for PipeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeOp::Read => write!(f, "read"),
            PipeOp::Write => write!(f, "write"),
        }
    }
}

/// Errors surfaced by pipes, the selector and sockets.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KsioError {
    /// Distinguished non-error termination (shutdown, timeout, close).
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// OS-reported failure, shared between every observer of the cause.
    #[error("i/o failure: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Write attempted after the pipe was closed for write.
    #[error("pipe is closed for write")]
    ClosedForWrite,

    /// End-of-stream reached before the requested amount of bytes.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Usage error: a second read (or write) while one is already in flight.
    #[error("concurrent {0} on the same pipe end")]
    ConcurrentOperation(PipeOp),

    /// Usage error: a live registration already exists for this interest.
    #[error("{interest} interest already registered for descriptor {fd}")]
    DuplicateRegistration { fd: RawFd, interest: Interest },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl KsioError {
    /// Shorthand for a cancellation cause.
    #[inline]
    pub fn cancelled(reason: CancelReason) -> Self {
        KsioError::Cancelled(reason)
    }

    /// True for the distinguished cancellation cause.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KsioError::Cancelled(_))
    }

    /// The cancellation reason, if this is a cancellation.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            KsioError::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// The kind of the underlying OS error, if this is an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            KsioError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// True for errors caused by misuse of the API rather than by the OS.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            KsioError::ConcurrentOperation(_) | KsioError::DuplicateRegistration { .. }
        )
    }
}

impl From<io::Error> for KsioError {
    fn from(e: io::Error) -> Self {
        KsioError::Io(Arc::new(e))
    }
}

impl From<KsioError> for io::Error {
    fn from(e: KsioError) -> Self {
        match e {
            KsioError::Io(inner) => match Arc::try_unwrap(inner) {
                Ok(inner) => inner,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            KsioError::Cancelled(CancelReason::Timeout) => {
                io::Error::new(io::ErrorKind::TimedOut, e)
            }
            KsioError::Cancelled(_) => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            KsioError::ClosedForWrite => io::Error::new(io::ErrorKind::BrokenPipe, e),
            KsioError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            KsioError::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = KsioError::Cancelled(CancelReason::Timeout);
        assert_eq!(e.to_string(), "operation cancelled: timed out");

        let e = KsioError::ConcurrentOperation(PipeOp::Read);
        assert_eq!(e.to_string(), "concurrent read on the same pipe end");

        let e = KsioError::DuplicateRegistration { fd: 7, interest: Interest::Read };
        assert_eq!(e.to_string(), "read interest already registered for descriptor 7");
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let e: KsioError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(e.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(!e.is_cancellation());

        let back: io::Error = e.into();
        assert_eq!(back.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_shared_cause_converts() {
        let e: KsioError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        let other = e.clone();
        let back: io::Error = e.into();
        assert_eq!(back.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(other.io_kind(), Some(io::ErrorKind::ConnectionReset));
    }

    #[test]
    fn test_classification() {
        assert!(KsioError::cancelled(CancelReason::Shutdown).is_cancellation());
        assert_eq!(
            KsioError::cancelled(CancelReason::Closed).cancel_reason(),
            Some(CancelReason::Closed)
        );
        assert!(KsioError::ConcurrentOperation(PipeOp::Write).is_usage_error());
        assert!(!KsioError::ClosedForWrite.is_usage_error());

        let timeout: io::Error = KsioError::cancelled(CancelReason::Timeout).into();
        assert_eq!(timeout.kind(), io::ErrorKind::TimedOut);
    }
}
