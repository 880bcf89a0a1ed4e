//! Connected socket exposed as a pair of pipes

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{abortable, AbortHandle, FutureExt};

use ksio_core::config::PipeConfig;
use ksio_core::error::{CancelReason, KsioError};
use ksio_core::pipe::{pipe, PipeReader, PipeWriter};

use crate::factory::SocketFactory;
use crate::pump::{read_pump, write_pump, SocketCore};

/// A connected TCP socket.
///
/// Incoming bytes are read from [`reader`](Self::reader); outgoing bytes are
/// written to [`writer`](Self::writer) and sent once flushed. Both handles can
/// be cloned and moved into other tasks.
///
/// Dropping the socket performs [`close`](Self::close).
pub struct Socket {
    core: Arc<SocketCore>,
    reader: PipeReader,
    writer: PipeWriter,
    read_pump: AbortHandle,
    write_pump: AbortHandle,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
    disposed: AtomicBool,
}

impl Socket {
    /// Wrap a connected, non-blocking socket and start its pumps.
    pub(crate) fn start(socket: socket2::Socket, factory: &SocketFactory, pipes: PipeConfig) -> Socket {
        let fd = socket.as_raw_fd();
        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        let remote = socket.peer_addr().ok().and_then(|a| a.as_socket());
        let core = Arc::new(SocketCore::new(
            fd,
            socket,
            factory.selector(),
            factory.config().pump_chunk_size,
        ));

        let (in_writer, in_reader) = pipe(pipes);
        let (out_writer, out_reader) = pipe(pipes);

        let (read_task, read_pump_handle) =
            abortable(read_pump(Arc::clone(&core), in_writer, core.guard()));
        let (write_task, write_pump_handle) =
            abortable(write_pump(Arc::clone(&core), out_reader, core.guard()));
        factory.spawn(read_task.map(drop));
        factory.spawn(write_task.map(drop));

        tracing::debug!(fd, ?local, ?remote, "socket started");
        Socket {
            core,
            reader: in_reader,
            writer: out_writer,
            read_pump: read_pump_handle,
            write_pump: write_pump_handle,
            local,
            remote,
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Bytes received from the peer.
    pub fn reader(&self) -> &PipeReader {
        &self.reader
    }

    /// Bytes to send to the peer.
    pub fn writer(&self) -> &PipeWriter {
        &self.writer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn raw_fd(&self) -> RawFd {
        self.core.fd()
    }

    /// Graceful close. Idempotent.
    ///
    /// Everything already written is still sent, followed by FIN. Reading
    /// stops: buffered incoming bytes stay readable, then end-of-stream.
    /// The descriptor is released once the write side has drained.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.close();
        self.read_pump.abort();
        tracing::trace!(fd = self.core.fd(), "socket closing");
    }

    /// Abrupt close. Idempotent.
    ///
    /// Both pipes fail with `Cancelled(Closed)`, unsent bytes are dropped and
    /// the descriptor is released immediately.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);
        let cause = KsioError::Cancelled(CancelReason::Closed);
        self.reader.cancel(cause.clone());
        self.writer.cancel(cause);
        self.read_pump.abort();
        self.write_pump.abort();
        self.core.release();
    }

    /// True after `close` or `dispose`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once the descriptor has been handed back to the OS.
    pub fn is_released(&self) -> bool {
        self.core.is_released()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.core.fd())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
