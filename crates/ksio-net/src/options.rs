//! Per-socket options

use std::io;
use std::time::Duration;

/// Options applied to sockets created by a `SocketFactory`.
///
/// `None` leaves the OS (or factory) default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// `TCP_NODELAY` on connected sockets
    pub no_delay: bool,
    /// `SO_KEEPALIVE` on connected sockets
    pub keep_alive: bool,
    /// `SO_REUSEADDR` on listeners
    pub reuse_address: bool,
    /// `SO_REUSEPORT` on listeners
    pub reuse_port: bool,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// `SO_LINGER`; `Some(Duration::ZERO)` makes close send a reset
    pub linger: Option<Duration>,
    /// Listen backlog (factory default when `None`)
    pub backlog: Option<i32>,
    /// Deadline for `connect`
    pub connect_timeout: Option<Duration>,
    /// Pipe capacity for this socket (factory default when `None`)
    pub pipe_capacity: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: false,
            reuse_address: true,
            reuse_port: false,
            recv_buffer_size: None,
            send_buffer_size: None,
            linger: None,
            backlog: None,
            connect_timeout: None,
            pipe_capacity: None,
        }
    }
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    pub fn keep_alive(mut self, enable: bool) -> Self {
        self.keep_alive = enable;
        self
    }

    pub fn reuse_address(mut self, enable: bool) -> Self {
        self.reuse_address = enable;
        self
    }

    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.reuse_port = enable;
        self
    }

    pub fn recv_buffer_size(mut self, bytes: usize) -> Self {
        self.recv_buffer_size = Some(bytes);
        self
    }

    pub fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = Some(bytes);
        self
    }

    pub fn linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = Some(bytes);
        self
    }

    fn apply_buffers(&self, socket: &socket2::Socket) -> io::Result<()> {
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(())
    }

    /// Options for a connected (or accepted) stream.
    pub(crate) fn apply_stream(&self, socket: &socket2::Socket) -> io::Result<()> {
        socket.set_tcp_nodelay(self.no_delay)?;
        socket.set_keepalive(self.keep_alive)?;
        if self.linger.is_some() {
            socket.set_linger(self.linger)?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;
        self.apply_buffers(socket)
    }

    /// Options for a listener, before `bind`.
    pub(crate) fn apply_listener(&self, socket: &socket2::Socket) -> io::Result<()> {
        socket.set_reuse_address(self.reuse_address)?;
        if self.reuse_port {
            socket.set_reuse_port(true)?;
        }
        self.apply_buffers(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Socket, Type};

    #[test]
    fn test_stream_options_take_effect() {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let opts = SocketOptions::new()
            .keep_alive(true)
            .linger(Some(Duration::ZERO));
        opts.apply_stream(&socket).unwrap();
        assert!(socket.tcp_nodelay().unwrap());
        assert!(socket.keepalive().unwrap());
        assert_eq!(socket.linger().unwrap(), Some(Duration::ZERO));
    }

    #[test]
    fn test_listener_options_take_effect() {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        SocketOptions::new().apply_listener(&socket).unwrap();
        assert!(socket.reuse_address().unwrap());
    }
}
