//! `EventFdNotifier`: the Linux doorbell.
//!
//! Writes to an eventfd to wake the selector thread out of `epoll_wait`.
//! Coalescing: multiple calls to `notify()` before the loop drains the
//! eventfd result in a single wakeup (eventfd counter semantics).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ksio_core::error::Result;
use ksio_core::poller::Notifier;
use nix::errno::Errno;

use crate::sys::cvt;

#[derive(Debug)]
pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking eventfd. Closed on drop.
    pub fn create() -> Result<Self> {
        // SAFETY: plain syscall, the returned descriptor is owned below.
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: `fd` is a fresh descriptor nobody else owns.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// The descriptor to watch for readability.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Reset the counter so the doorbell stops reporting readable.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        // SAFETY: reading 8 bytes into a local u64.
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if let Err(e) = Errno::result(ret) {
            if e != Errno::EAGAIN {
                tracing::warn!(error = %e, "eventfd drain failed");
            }
        }
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        // SAFETY: writing 8 bytes from a local u64.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(()),
            // Counter saturated: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}
