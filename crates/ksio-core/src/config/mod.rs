//! Transport configuration
//!
//! Compile-time defaults with runtime environment overrides, highest wins:
//!
//! 1. Builder setters
//! 2. Environment variables (`KSIO_*`)
//! 3. [`defaults`]
//!
//! ```rust,ignore
//! use ksio_core::config::TransportConfig;
//!
//! let config = TransportConfig::from_env()
//!     .pipe_capacity(16 * 1024)
//!     .worker_threads(2);
//! config.validate()?;
//! ```

pub mod defaults;

use std::str::FromStr;

use crate::error::{KsioError, Result};

/// Parse `key` from the environment, falling back to `default` when the
/// variable is unset or does not parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                default
            }
        },
        Err(_) => default,
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ============================================================================
// Pipe
// ============================================================================

/// Construction parameters of a single pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    /// Ring capacity in bytes; fixed for the lifetime of the pipe.
    pub capacity: usize,
    /// Publish every accepted chunk immediately instead of waiting for `flush`.
    pub auto_flush: bool,
}

impl PipeConfig {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, auto_flush: false }
    }

    pub fn auto_flush(mut self, enable: bool) -> Self {
        self.auto_flush = enable;
        self
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self::new(defaults::PIPE_CAPACITY)
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Selector wait-loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Name given to the wait-loop thread
    pub thread_name: String,
    /// Readiness events fetched per wait
    pub max_events: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            thread_name: defaults::SELECTOR_THREAD_NAME.to_string(),
            max_events: defaults::MAX_EVENTS,
        }
    }
}

impl SelectorConfig {
    /// Defaults with environment overrides.
    ///
    /// - `KSIO_SELECTOR_THREAD_NAME` - wait-loop thread name
    /// - `KSIO_MAX_EVENTS` - events per wait
    pub fn from_env() -> Self {
        Self {
            thread_name: env_or(
                "KSIO_SELECTOR_THREAD_NAME",
                defaults::SELECTOR_THREAD_NAME.to_string(),
            ),
            max_events: env_or("KSIO_MAX_EVENTS", defaults::MAX_EVENTS),
        }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(KsioError::Config("max_events must be at least 1"));
        }
        if self.thread_name.is_empty() {
            return Err(KsioError::Config("selector thread name must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Settings for a socket factory and everything it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Ring capacity of each socket pipe
    pub pipe_capacity: usize,
    /// Largest single recv/send done by a pump
    pub pump_chunk_size: usize,
    /// Threads of the pump worker pool
    pub worker_threads: usize,
    /// Default listen backlog
    pub backlog: i32,
    /// Selector settings
    pub selector: SelectorConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: defaults::PIPE_CAPACITY,
            pump_chunk_size: defaults::PUMP_CHUNK_SIZE,
            worker_threads: available_cpus(),
            backlog: defaults::BACKLOG,
            selector: SelectorConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `KSIO_PIPE_CAPACITY` - bytes per socket pipe
    /// - `KSIO_PUMP_CHUNK_SIZE` - bytes per recv/send
    /// - `KSIO_WORKER_THREADS` - pump pool size (0 = one per CPU)
    /// - `KSIO_BACKLOG` - listen backlog
    /// - `KSIO_SELECTOR_THREAD_NAME`, `KSIO_MAX_EVENTS` - see [`SelectorConfig::from_env`]
    pub fn from_env() -> Self {
        let workers = env_or("KSIO_WORKER_THREADS", defaults::WORKER_THREADS);
        Self {
            pipe_capacity: env_or("KSIO_PIPE_CAPACITY", defaults::PIPE_CAPACITY),
            pump_chunk_size: env_or("KSIO_PUMP_CHUNK_SIZE", defaults::PUMP_CHUNK_SIZE),
            worker_threads: if workers == 0 { available_cpus() } else { workers },
            backlog: env_or("KSIO_BACKLOG", defaults::BACKLOG),
            selector: SelectorConfig::from_env(),
        }
    }

    pub fn pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes;
        self
    }

    pub fn pump_chunk_size(mut self, bytes: usize) -> Self {
        self.pump_chunk_size = bytes;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    /// Pipe parameters for both pipes of every socket, before per-socket overrides.
    pub fn socket_pipe(&self) -> PipeConfig {
        PipeConfig::new(self.pipe_capacity)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipe_capacity == 0 {
            return Err(KsioError::Config("pipe_capacity must be at least 1"));
        }
        if self.pump_chunk_size == 0 {
            return Err(KsioError::Config("pump_chunk_size must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(KsioError::Config("worker_threads must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(KsioError::Config("backlog must be positive"));
        }
        self.selector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert_eq!(config.pipe_capacity, 4096);
        assert_eq!(config.selector.thread_name, "ksio-selector");
        assert!(config.worker_threads >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder_and_validation() {
        let config = TransportConfig::default().pipe_capacity(0);
        assert!(matches!(config.validate(), Err(KsioError::Config(_))));

        let config = TransportConfig::default()
            .pipe_capacity(64)
            .worker_threads(2)
            .selector(SelectorConfig::default().max_events(0));
        assert!(config.validate().is_err());

        let config = config.selector(SelectorConfig::default().thread_name("io"));
        config.validate().unwrap();
        assert_eq!(config.socket_pipe(), PipeConfig::new(64));
    }

    #[test]
    fn test_env_override() {
        // Variable names unique to this test; nothing else reads them.
        std::env::set_var("KSIO_TEST_ONLY_NUMBER", "17");
        std::env::set_var("KSIO_TEST_ONLY_GARBAGE", "seventeen");
        assert_eq!(env_or("KSIO_TEST_ONLY_NUMBER", 3usize), 17);
        assert_eq!(env_or("KSIO_TEST_ONLY_GARBAGE", 3usize), 3);
        assert_eq!(env_or("KSIO_TEST_ONLY_UNSET", 3usize), 3);
    }

    #[test]
    fn test_pipe_config() {
        let config = PipeConfig::default();
        assert_eq!(config.capacity, defaults::PIPE_CAPACITY);
        assert!(!config.auto_flush);
        assert!(PipeConfig::new(8).auto_flush(true).auto_flush);
    }
}
