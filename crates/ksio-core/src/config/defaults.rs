//! Compile-time defaults
//!
//! Every value here can be overridden at runtime through the matching
//! `KSIO_*` environment variable (see [`super::TransportConfig::from_env`]).

/// Ring capacity of each socket pipe, in bytes.
pub const PIPE_CAPACITY: usize = 4096;

/// Largest single `recv`/`send` performed by a pump.
pub const PUMP_CHUNK_SIZE: usize = 4096;

/// Listen backlog for server sockets.
pub const BACKLOG: i32 = 1024;

/// Events fetched per `wait` call by the selector.
pub const MAX_EVENTS: usize = 256;

/// Name of the selector's wait-loop thread.
pub const SELECTOR_THREAD_NAME: &str = "ksio-selector";

/// Pump worker threads; 0 means one per available CPU.
pub const WORKER_THREADS: usize = 0;
