//! Listening socket

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use ksio_core::error::{CancelReason, KsioError, Result};
use ksio_core::interest::Interest;

use crate::factory::SocketFactory;
use crate::options::SocketOptions;
use crate::socket::Socket;

/// A bound, listening TCP socket.
///
/// One `accept` may be pending at a time; a concurrent second one fails with
/// `DuplicateRegistration`.
pub struct ServerSocket {
    socket: socket2::Socket,
    factory: SocketFactory,
    options: SocketOptions,
    local: Option<SocketAddr>,
    closed: AtomicBool,
}

impl ServerSocket {
    pub(crate) fn new(socket: socket2::Socket, factory: SocketFactory, options: SocketOptions) -> Self {
        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        tracing::debug!(fd = socket.as_raw_fd(), ?local, "listening");
        Self {
            socket,
            factory,
            options,
            local,
            closed: AtomicBool::new(false),
        }
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Socket> {
        let fd = self.socket.as_raw_fd();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(KsioError::Cancelled(CancelReason::Closed));
            }
            match self.socket.accept() {
                Ok((conn, _peer)) => {
                    conn.set_nonblocking(true)?;
                    self.options.apply_stream(&conn)?;
                    let pipes = self.factory.pipe_config(&self.options);
                    return Ok(Socket::start(conn, &self.factory, pipes));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let ready = self.factory.selector().register(fd, Interest::Accept);
                    // A close queued before this registration would never cancel it.
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(KsioError::Cancelled(CancelReason::Closed));
                    }
                    ready.await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The peer gave up between SYN and accept.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Stop accepting: a pending `accept` fails with `Cancelled(Closed)`.
    /// The descriptor itself is closed on drop. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.factory.selector().notify_closed(self.socket.as_raw_fd());
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("fd", &self.socket.as_raw_fd())
            .field("local", &self.local)
            .finish()
    }
}
