//! OS readiness multiplexing abstraction.
//!
//! A [`Poller`] is the platform-specific half of the selector: it keeps the
//! OS watch set and blocks until something is ready. The selector's wait loop
//! owns it exclusively; other threads only ever touch its [`Notifier`].
//!
//! # Implementors
//!
//! - `EpollPoller` (Linux, default): level-triggered epoll, eventfd doorbell.
//! - `PollPoller` (any unix): `poll(2)` over a rebuilt pollfd array,
//!   self-pipe doorbell.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::Result;
use crate::interest::{InterestSet, Readiness};

/// Wakes a thread blocked in [`Poller::wait`].
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the waiter wakes are coalesced.
/// - The poller drains the doorbell itself; it never shows up as a
///   [`ReadyEvent`].
pub trait Notifier: Send + Sync {
    /// Ring the doorbell.
    fn notify(&self) -> Result<()>;
}

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub ready: Readiness,
}

/// Platform readiness backend.
pub trait Poller: Send {
    /// Set the OS-level interest of `fd` to exactly `interests`.
    ///
    /// Adds the descriptor if it is not watched yet.
    fn watch(&mut self, fd: RawFd, interests: InterestSet) -> Result<()>;

    /// Stop watching `fd`. Unknown or already-closed descriptors are ignored.
    fn unwatch(&mut self, fd: RawFd) -> Result<()>;

    /// Block until at least one watched descriptor is ready or the doorbell
    /// rings, then append up to `max_events` reports to `events`.
    ///
    /// There is no timeout. A signal interruption returns `Ok` with no events.
    fn wait(&mut self, events: &mut Vec<ReadyEvent>, max_events: usize) -> Result<()>;

    /// The doorbell for this poller.
    fn notifier(&self) -> Arc<dyn Notifier>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
