//! Thin helpers around raw libc calls.

use std::io;
use std::os::fd::RawFd;

use ksio_core::error::{KsioError, Result};
use nix::errno::{Errno, ErrnoSentinel};

/// Convert a libc return value (`-1` + errno on failure) into a `Result`.
#[inline]
pub(crate) fn cvt<S: ErrnoSentinel + PartialEq<S>>(ret: S) -> Result<S> {
    Errno::result(ret).map_err(|e| KsioError::from(io::Error::from(e)))
}

/// Put `fd` into non-blocking, close-on-exec mode.
pub(crate) fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own; flags only.
    unsafe {
        let fl = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK))?;
        let fd_fl = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, fd_fl | libc::FD_CLOEXEC))?;
    }
    Ok(())
}
