//! # ksio-module: default implementations
//!
//! This crate provides the default implementation for every ksio-core
//! trait. Each impl favours correctness and simplicity.
//!
//! ## Default stack
//!
//! | Trait      | Linux default     | Other unix         |
//! |------------|-------------------|--------------------|
//! | Selector   | SelectorManager   | SelectorManager    |
//! | Poller     | EpollPoller       | PollPoller         |
//! | Notifier   | EventFdNotifier   | SelfPipeNotifier   |
//!
//! `PollPoller` is available everywhere and can be forced through
//! [`SelectorManager::with_poller`]. [`Timer`] is the deadline thread used
//! for connect and read timeouts.

pub mod poll_poller;
pub mod selector_manager;
pub mod self_pipe_notifier;
pub mod timer;

mod sys;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll_poller;
        pub mod eventfd_notifier;

        /// Poller used by [`SelectorManager::new`].
        pub type DefaultPoller = epoll_poller::EpollPoller;
    } else {
        /// Poller used by [`SelectorManager::new`].
        pub type DefaultPoller = poll_poller::PollPoller;
    }
}

pub use poll_poller::PollPoller;
pub use selector_manager::{SelectorManager, SelectorStats};
pub use self_pipe_notifier::SelfPipeNotifier;
pub use timer::{Sleep, Timer};

#[cfg(target_os = "linux")]
pub use epoll_poller::EpollPoller;
#[cfg(target_os = "linux")]
pub use eventfd_notifier::EventFdNotifier;
