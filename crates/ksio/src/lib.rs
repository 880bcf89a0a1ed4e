//! # ksio
//!
//! An asynchronous, backpressured byte-transport core:
//!
//! - **Pipes**: bounded byte channels whose writers suspend when full and
//!   whose readers suspend when empty ([`pipe`], [`PipeReader`], [`PipeWriter`])
//! - **Selector**: one OS thread multiplexing readiness waits for many
//!   descriptors ([`SelectorManager`])
//! - **Sockets**: TCP connections exposed as a pipe pair, driven by pumps on
//!   a small worker pool ([`SocketFactory`], [`Socket`], [`ServerSocket`])
//!
//! ## Quick Start
//!
//! ```ignore
//! use ksio::{SocketFactory, SocketOptions, TransportConfig};
//!
//! let factory = SocketFactory::new(TransportConfig::from_env())?;
//! let server = factory.bind("127.0.0.1:9999".parse()?, &SocketOptions::default())?;
//! let echo = factory.clone();
//! factory.spawn(async move {
//!     while let Ok(sock) = server.accept().await {
//!         echo.spawn(async move {
//!             let _ = sock.reader().copy_to(sock.writer()).await;
//!             sock.close();
//!         });
//!     }
//! });
//! ```
//!
//! ## Crate Structure
//!
//! - `ksio-core`: pipes, errors, configuration, selector and poller traits
//! - `ksio-module`: selector wait loop, epoll/poll backends, timer
//! - `ksio-net`: socket adapter

pub use ksio_core::config::{self, defaults, PipeConfig, SelectorConfig, TransportConfig};
pub use ksio_core::error::{CancelReason, KsioError, PipeOp, Result};
pub use ksio_core::interest::{Interest, InterestSet, Readiness};
pub use ksio_core::pipe::{pipe, PipeRead, PipeReader, PipeWrite, PipeWriter, ReadOutcome};
pub use ksio_core::poller::{Notifier, Poller, ReadyEvent};
pub use ksio_core::selector::{Registration, Selector};

pub use ksio_module::{DefaultPoller, PollPoller, SelectorManager, SelectorStats, Sleep, Timer};

pub use ksio_net::{ServerSocket, Socket, SocketFactory, SocketOptions};

/// Prelude for the common case: pipes and sockets.
pub mod prelude {
    pub use crate::{
        pipe, CancelReason, KsioError, PipeConfig, PipeReader, PipeWriter, ReadOutcome,
        Result, ServerSocket, Socket, SocketFactory, SocketOptions, TransportConfig,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use futures::executor::block_on;

    #[test]
    fn test_facade_exposes_pipe_round_trip() {
        let (w, r) = pipe(PipeConfig::default());
        block_on(async {
            w.write(b"facade").await.unwrap();
            w.close();
            let mut buf = [0u8; 16];
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::Data(6));
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::EndOfStream);
        });
    }
}
