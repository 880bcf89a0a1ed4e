//! # ksio-core: contracts for the ksio transport
//!
//! This crate holds everything that does not touch the OS:
//!
//! - [`pipe`]: the bounded, backpressured byte pipe
//! - [`selector`]: the registration contract implemented by the wait loop
//! - [`poller`]: the per-platform readiness backend and its doorbell
//! - [`interest`], [`error`], [`config`]
//!
//! Default implementations of the traits live in `ksio-module`; sockets
//! built on top of both live in `ksio-net`.

pub mod config;
pub mod error;
pub mod interest;
pub mod pipe;
pub mod poller;
pub mod selector;

pub use config::{PipeConfig, SelectorConfig, TransportConfig};
pub use error::{CancelReason, KsioError, PipeOp, Result};
pub use interest::{Interest, InterestSet, Readiness};
pub use pipe::{pipe, PipeRead, PipeReader, PipeWrite, PipeWriter, ReadOutcome};
pub use poller::{Notifier, Poller, ReadyEvent};
pub use selector::{registration, Completer, Registration, Selector};
