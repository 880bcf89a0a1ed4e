//! Socket factory: owner of the selector, the pump pool and the timer

use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use futures::executor::ThreadPool;
use socket2::{Domain, Protocol, Type};

use ksio_core::config::{PipeConfig, TransportConfig};
use ksio_core::error::Result;
use ksio_core::interest::Interest;
use ksio_core::selector::Selector;
use ksio_module::{SelectorManager, Timer};

use crate::options::SocketOptions;
use crate::server::ServerSocket;
use crate::socket::Socket;

/// Creates client and server sockets bound to one selector.
///
/// Cheap to clone; every clone shares the same selector thread, worker pool
/// and timer. There is no global instance: the factory owns its threads, and
/// they stop when the last clone (and every socket made from it) is gone.
#[derive(Clone)]
pub struct SocketFactory {
    config: Arc<TransportConfig>,
    selector: Arc<dyn Selector>,
    pool: ThreadPool,
    timer: Arc<Timer>,
}

impl SocketFactory {
    /// Build and start a selector, a worker pool and a timer for `config`.
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let selector = SelectorManager::new(config.selector.clone())?;
        selector.start()?;
        let pool = ThreadPool::builder()
            .pool_size(config.worker_threads)
            .name_prefix("ksio-worker-")
            .create()?;
        let timer = Timer::new("ksio-timer")?;
        tracing::info!(
            workers = config.worker_threads,
            pipe_capacity = config.pipe_capacity,
            "socket factory ready"
        );
        Ok(Self::with_parts(config, Arc::new(selector), pool, Arc::new(timer)))
    }

    /// Assemble a factory from externally built parts. `selector` must be started.
    pub fn with_parts(
        config: TransportConfig,
        selector: Arc<dyn Selector>,
        pool: ThreadPool,
        timer: Arc<Timer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            selector,
            pool,
            timer,
        }
    }

    /// Open a connection to `addr`.
    ///
    /// Fails with the OS error if the connection is refused, or with
    /// `Cancelled(Timeout)` if `options.connect_timeout` elapses first.
    pub async fn connect(&self, addr: SocketAddr, options: &SocketOptions) -> Result<Socket> {
        match options.connect_timeout {
            Some(limit) => self.timer.timeout(limit, self.connect_now(addr, options)).await,
            None => self.connect_now(addr, options).await,
        }
    }

    async fn connect_now(&self, addr: SocketAddr, options: &SocketOptions) -> Result<Socket> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        options.apply_stream(&socket)?;
        let mut pending = Connecting {
            fd: socket.as_raw_fd(),
            selector: self.selector.as_ref(),
            armed: true,
        };

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                self.selector.register(pending.fd, Interest::Connect).await?;
                if let Some(err) = socket.take_error()? {
                    tracing::debug!(%addr, error = %err, "connect failed");
                    return Err(err.into());
                }
            }
            Err(e) => return Err(e.into()),
        }

        pending.armed = false;
        Ok(Socket::start(socket, self, self.pipe_config(options)))
    }

    /// Bind a listening socket to `addr`.
    pub fn bind(&self, addr: SocketAddr, options: &SocketOptions) -> Result<ServerSocket> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        options.apply_listener(&socket)?;
        socket.bind(&addr.into())?;
        socket.listen(options.backlog.unwrap_or(self.config.backlog))?;
        Ok(ServerSocket::new(socket, self.clone(), options.clone()))
    }

    /// Run `fut` on the worker pool.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.spawn_ok(fut);
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn selector(&self) -> Arc<dyn Selector> {
        Arc::clone(&self.selector)
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Ask the selector to terminate.
    ///
    /// Every pending and future readiness wait fails with
    /// `Cancelled(Shutdown)`: read pumps end and cancel their read pipe with
    /// that cause, as does a write pump blocked on a full send buffer. A write
    /// pump idle on an empty write pipe never touches the selector and keeps
    /// running until its socket is closed or disposed, so live sockets must
    /// still be closed to release their descriptors.
    pub fn shutdown(&self) {
        self.selector.request_termination();
    }

    /// Pipe parameters for a socket: the transport's, with the per-socket
    /// capacity override applied.
    pub(crate) fn pipe_config(&self, options: &SocketOptions) -> PipeConfig {
        let mut config = self.config.socket_pipe();
        if let Some(capacity) = options.pipe_capacity {
            config.capacity = capacity.max(1);
        }
        config
    }
}

/// Withdraws an in-flight connect from the selector if it is abandoned
/// (error, timeout, drop). Declared after the socket, so it runs before the
/// descriptor is closed.
struct Connecting<'a> {
    fd: RawFd,
    selector: &'a dyn Selector,
    armed: bool,
}

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.selector.notify_closed(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksio_core::error::KsioError;

    #[test]
    fn test_invalid_config_is_rejected() {
        let res = SocketFactory::new(TransportConfig::default().pipe_capacity(0));
        assert!(matches!(res, Err(KsioError::Config(_))));
    }

    #[test]
    fn test_per_socket_capacity_override() {
        let factory = SocketFactory::new(TransportConfig::default().worker_threads(1)).unwrap();
        assert_eq!(factory.pipe_config(&SocketOptions::default()), PipeConfig::new(4096));
        assert_eq!(factory.pipe_config(&SocketOptions::default().pipe_capacity(64)).capacity, 64);
        assert_eq!(factory.pipe_config(&SocketOptions::default().pipe_capacity(0)).capacity, 1);
    }

    #[test]
    fn test_shutdown_fails_new_connects() {
        let factory = SocketFactory::new(TransportConfig::default().worker_threads(1)).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        factory.shutdown();
        // Loopback connects may finish synchronously; a pending one must fail.
        if let Err(e) = futures::executor::block_on(factory.connect(addr, &SocketOptions::default())) {
            assert!(e.is_cancellation());
        }
    }
}
