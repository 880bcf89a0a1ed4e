//! # ksio-net: the socket adapter
//!
//! Turns TCP sockets into pipe pairs. A [`SocketFactory`] owns a selector
//! thread, a small worker pool for the pumps and a timer:
//!
//! ```rust,ignore
//! let factory = SocketFactory::new(TransportConfig::from_env())?;
//! let sock = factory.connect(addr, &SocketOptions::default()).await?;
//! sock.writer().write(b"hello").await?;
//! sock.writer().flush()?;
//! let mut buf = [0u8; 64];
//! let n = sock.reader().read(&mut buf).await?;
//! ```
//!
//! Protocol code only ever sees the [`PipeReader`](ksio_core::PipeReader) /
//! [`PipeWriter`](ksio_core::PipeWriter) pair.

pub mod factory;
pub mod options;
pub mod server;
pub mod socket;

mod pump;

pub use factory::SocketFactory;
pub use options::SocketOptions;
pub use server::ServerSocket;
pub use socket::Socket;
