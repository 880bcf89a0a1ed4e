//! `SelfPipeNotifier`: portable doorbell built on a non-blocking pipe.
//!
//! `notify()` writes one byte; a full pipe already guarantees a pending
//! wakeup, so `EAGAIN` is success.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ksio_core::error::Result;
use ksio_core::poller::Notifier;
use nix::errno::Errno;

use crate::sys::{cvt, set_nonblock_cloexec};

#[derive(Debug)]
pub struct SelfPipeNotifier {
    read: OwnedFd,
    write: OwnedFd,
}

impl SelfPipeNotifier {
    pub fn create() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) returns.
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: both descriptors are fresh and owned from here on.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblock_cloexec(read.as_raw_fd())?;
        set_nonblock_cloexec(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    /// Read end, to be watched for readability.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Empty the pipe.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading into a local buffer of the given length.
            let ret = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            match Errno::result(ret) {
                Ok(n) if n as usize == buf.len() => continue,
                Ok(_) | Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "self-pipe drain failed");
                    return;
                }
            }
        }
    }
}

impl Notifier for SelfPipeNotifier {
    fn notify(&self) -> Result<()> {
        let byte = 1u8;
        // SAFETY: writing one byte from a local.
        let ret = unsafe {
            libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1)
        };
        match Errno::result(ret) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}
