//! Socket core and the two pumps moving bytes between a socket and its pipes
//!
//! ```text
//!   peer ──recv──▶ read pump ──▶ read pipe  ──▶ application
//!   application ──▶ write pipe ──▶ write pump ──send──▶ peer
//! ```
//!
//! Each pump holds a [`PumpGuard`]. The descriptor is released (close
//! notification, then close) when the last guard drops, or earlier by an
//! explicit [`SocketCore::release`].

use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use ksio_core::error::KsioError;
use ksio_core::interest::Interest;
use ksio_core::pipe::{PipeReader, PipeWriter, ReadOutcome};
use ksio_core::selector::{Registration, Selector};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Peer resets must surface as errors, never as SIGPIPE.
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        // Elsewhere SO_NOSIGPIPE is set on the socket instead.
        const SEND_FLAGS: libc::c_int = 0;
    }
}

/// Descriptor shared by a socket handle and its pumps.
pub(crate) struct SocketCore {
    fd: RawFd,
    socket: RwLock<Option<socket2::Socket>>,
    selector: Arc<dyn Selector>,
    live_pumps: AtomicUsize,
    chunk_size: usize,
}

impl SocketCore {
    pub(crate) fn new(
        fd: RawFd,
        socket: socket2::Socket,
        selector: Arc<dyn Selector>,
        chunk_size: usize,
    ) -> Self {
        Self {
            fd,
            socket: RwLock::new(Some(socket)),
            selector,
            live_pumps: AtomicUsize::new(0),
            chunk_size,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Run `f` on the socket unless it was already released.
    fn with_socket<R>(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<R>) -> Option<io::Result<R>> {
        self.socket.read().as_ref().map(f)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.socket.read().is_none()
    }

    /// Register `interest` unless the descriptor was already released.
    ///
    /// The read lock keeps `release` out, so the registration is always queued
    /// before the close notification and never lands on a reused number.
    pub(crate) fn register(&self, interest: Interest) -> Option<Registration> {
        let socket = self.socket.read();
        socket.as_ref().map(|_| self.selector.register(self.fd, interest))
    }

    /// Withdraw the descriptor from the selector and close it. Idempotent.
    pub(crate) fn release(&self) {
        let mut slot = self.socket.write();
        if let Some(socket) = slot.take() {
            self.selector.notify_closed(self.fd);
            drop(socket);
            tracing::debug!(fd = self.fd, "socket released");
        }
    }

    /// Count a pump that is about to be spawned.
    pub(crate) fn guard(self: &Arc<Self>) -> PumpGuard {
        self.live_pumps.fetch_add(1, Ordering::AcqRel);
        PumpGuard { core: Arc::clone(self) }
    }
}

/// Releases the socket when the last pump goes away.
pub(crate) struct PumpGuard {
    core: Arc<SocketCore>,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if self.core.live_pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.release();
        }
    }
}

/// Wait for `interest`. `false` means the pump should stop; the pipe has
/// already been told why unless the stop is our own release.
async fn await_ready(core: &SocketCore, interest: Interest, fail: impl FnOnce(KsioError)) -> bool {
    let Some(ready) = core.register(interest) else {
        return false;
    };
    match ready.await {
        Ok(()) => true,
        Err(_) if core.is_released() => false,
        Err(e) => {
            tracing::debug!(fd = core.fd, %interest, error = %e, "registration failed");
            fail(e);
            false
        }
    }
}

/// Socket to read pipe. Ends at end-of-stream, on error, or when aborted.
pub(crate) async fn read_pump(core: Arc<SocketCore>, pipe: PipeWriter, _guard: PumpGuard) {
    let fd = core.fd;
    let mut buf = vec![0u8; core.chunk_size];
    tracing::trace!(fd, "read pump started");
    loop {
        let res = match core.with_socket(|s| {
            let mut sock = s;
            sock.read(&mut buf)
        }) {
            Some(res) => res,
            None => return,
        };
        match res {
            Ok(0) => {
                tracing::trace!(fd, "peer closed its write half");
                pipe.close();
                return;
            }
            Ok(n) => {
                let delivered = match pipe.write(&buf[..n]).await {
                    Ok(()) => pipe.flush(),
                    Err(e) => Err(e),
                };
                if let Err(e) = delivered {
                    // The application side cancelled or went away.
                    tracing::trace!(fd, error = %e, "read pipe no longer accepts data");
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !await_ready(&core, Interest::Read, |e| pipe.cancel(e)).await {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(fd, error = %e, "read pump failed");
                pipe.cancel(e.into());
                return;
            }
        }
    }
}

/// Write pipe to socket. At end-of-stream shuts down the write half (FIN).
pub(crate) async fn write_pump(core: Arc<SocketCore>, pipe: PipeReader, _guard: PumpGuard) {
    let fd = core.fd;
    let mut buf = vec![0u8; core.chunk_size];
    tracing::trace!(fd, "write pump started");
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(ReadOutcome::Data(n)) => n,
            Ok(ReadOutcome::EndOfStream) => {
                if let Some(Err(e)) = core.with_socket(|s| s.shutdown(Shutdown::Write)) {
                    tracing::debug!(fd, error = %e, "shutdown(write) failed");
                }
                tracing::trace!(fd, "write half closed");
                return;
            }
            Err(e) => {
                tracing::trace!(fd, error = %e, "write pipe cancelled");
                return;
            }
        };

        let mut sent = 0;
        while sent < n {
            let res = match core.with_socket(|s| s.send_with_flags(&buf[sent..n], SEND_FLAGS)) {
                Some(res) => res,
                None => return,
            };
            match res {
                Ok(k) => sent += k,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !await_ready(&core, Interest::Write, |e| pipe.cancel(e)).await {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(fd, error = %e, "write pump failed");
                    pipe.cancel(e.into());
                    return;
                }
            }
        }
    }
}
