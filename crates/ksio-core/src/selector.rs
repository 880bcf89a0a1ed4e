//! Readiness registration contract.
//!
//! A [`Selector`] turns "tell me when this descriptor is ready for X" into a
//! [`Registration`] future. Registering never blocks the caller; the
//! selector's own thread watches the descriptor and resolves the future.
//!
//! Outcomes of a registration:
//!
//! | Resolves with                         | When |
//! |---------------------------------------|------|
//! | `Ok(())`                              | the interest is ready (or the descriptor hung up / errored) |
//! | `Err(Cancelled(Shutdown))`            | the selector terminated first |
//! | `Err(Cancelled(Closed))`              | `notify_closed(fd)` was called first |
//! | `Err(DuplicateRegistration { .. })`   | a live registration for the same `(fd, interest)` exists |
//! | `Err(Io(_))`                          | the OS refused to watch the descriptor |

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{CancelReason, KsioError, Result};
use crate::interest::Interest;

/// Multiplexes readiness waits of many descriptors onto one thread.
pub trait Selector: Send + Sync {
    /// Ask to be woken when `fd` is ready for `interest`.
    fn register(&self, fd: RawFd, interest: Interest) -> Registration;

    /// `fd` is about to be closed: cancel its registrations with
    /// `Cancelled(Closed)` and drop its OS watch entry.
    ///
    /// Must be called before the descriptor number can be reused.
    fn notify_closed(&self, fd: RawFd);

    /// Start the wait loop. Idempotent.
    fn start(&self) -> Result<()>;

    /// Begin termination. Idempotent; returns without waiting.
    fn request_termination(&self);

    /// True once every registration has been resolved and the loop is gone.
    fn is_terminated(&self) -> bool;
}

/// Create a linked completer/registration pair.
pub fn registration() -> (Completer, Registration) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Registration { rx })
}

/// Awaitable side of a registration.
///
/// Dropping it abandons the registration; the selector notices and discards
/// it without waking anybody.
#[derive(Debug)]
#[must_use = "a registration does nothing unless awaited"]
pub struct Registration {
    rx: oneshot::Receiver<Result<()>>,
}

impl Registration {
    /// A registration that is already resolved with `err`.
    pub fn failed(err: KsioError) -> Self {
        let (completer, registration) = registration();
        completer.fail(err);
        registration
    }
}

impl Future for Registration {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            // Completer dropped without an answer: its owner went away.
            Poll::Ready(Err(oneshot::Canceled)) => {
                Poll::Ready(Err(KsioError::Cancelled(CancelReason::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Selector-side handle of a registration. Resolving consumes it.
#[derive(Debug)]
pub struct Completer {
    tx: oneshot::Sender<Result<()>>,
}

impl Completer {
    /// Resolve with readiness.
    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Resolve with a failure.
    pub fn fail(self, err: KsioError) {
        let _ = self.tx.send(Err(err));
    }

    /// True if the awaiting side was dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_complete_and_fail() {
        let (completer, reg) = registration();
        completer.complete();
        assert!(block_on(reg).is_ok());

        let (completer, reg) = registration();
        completer.fail(KsioError::Cancelled(CancelReason::Closed));
        let err = block_on(reg).unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Closed));
    }

    #[test]
    fn test_dropped_completer_means_shutdown() {
        let (completer, reg) = registration();
        drop(completer);
        let err = block_on(reg).unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_abandonment_is_visible() {
        let (completer, reg) = registration();
        assert!(!completer.is_abandoned());
        drop(reg);
        assert!(completer.is_abandoned());
    }

    #[test]
    fn test_pre_failed_registration() {
        let reg = Registration::failed(KsioError::ClosedForWrite);
        assert!(matches!(block_on(reg), Err(KsioError::ClosedForWrite)));
    }
}
