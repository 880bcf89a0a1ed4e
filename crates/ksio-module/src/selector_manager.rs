//! # SelectorManager: the readiness wait loop
//!
//! The manager runs on one dedicated OS thread. It:
//! 1. Drains the registration and close queues into the per-descriptor table
//! 2. Syncs the OS watch set of every touched descriptor
//! 3. Blocks in [`Poller::wait`] until readiness or the doorbell
//! 4. Drains the queues again, then completes every registration whose
//!    interest the readiness satisfies
//!
//! Callers never touch the table: `register` and `notify_closed` push onto
//! a `SegQueue` and ring the doorbell, so they never block. Both carry a
//! ticket from one counter; the loop applies a drained batch in ticket order,
//! so a close cancels registrations made before it and never ones made after
//! it (the descriptor number may already belong to a new socket).
//!
//! ## Termination
//!
//! `request_termination` flips the state and rings the doorbell; the loop
//! fails everything still queued or watched with `Cancelled(Shutdown)`. A
//! `register` racing with that drain is settled by a fence handshake: the
//! registering thread pushes, fences, then re-reads the state, and fails the
//! queue itself if termination already started.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use ksio_core::config::SelectorConfig;
use ksio_core::error::{CancelReason, KsioError, Result};
use ksio_core::interest::{Interest, InterestSet};
use ksio_core::poller::{Notifier, Poller, ReadyEvent};
use ksio_core::selector::{registration, Completer, Registration, Selector};

use crate::DefaultPoller;

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_TERMINATING: u8 = 2;
const STATE_TERMINATED: u8 = 3;

/// Counters exposed by [`SelectorManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorStats {
    /// `register` calls accepted onto the intake queue
    pub registrations: u64,
    /// Registrations resolved by readiness
    pub completions: u64,
    /// Registrations rejected as duplicates
    pub rejections: u64,
    /// Registrations failed by close, shutdown or OS errors
    pub cancellations: u64,
    /// Returns from `Poller::wait`
    pub wakeups: u64,
}

#[derive(Default)]
struct Counters {
    registrations: AtomicU64,
    completions: AtomicU64,
    rejections: AtomicU64,
    cancellations: AtomicU64,
    wakeups: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct PendingRegistration {
    ticket: u64,
    fd: RawFd,
    interest: Interest,
    completer: Completer,
}

/// State shared between handles and the loop thread.
struct Inner {
    config: SelectorConfig,
    intake: SegQueue<PendingRegistration>,
    closes: SegQueue<(u64, RawFd)>,
    tickets: AtomicU64,
    notifier: Arc<dyn Notifier>,
    state: AtomicU8,
    counters: Counters,
}

impl Inner {
    /// SeqCst so callers can order their own flags against queued operations.
    #[inline]
    fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    fn ring(&self) {
        if let Err(e) = self.notifier.notify() {
            tracing::warn!(error = %e, "selector doorbell failed");
        }
    }

    /// Fail everything sitting in the intake queue.
    fn fail_intake(&self) {
        let mut n = 0;
        while let Some(pending) = self.intake.pop() {
            pending.completer.fail(KsioError::Cancelled(CancelReason::Shutdown));
            n += 1;
        }
        Counters::bump(&self.counters.cancellations, n);
    }
}

/// Default [`Selector`]: one wait-loop thread over a [`Poller`].
///
/// Explicitly constructed and owned; there is no process-wide instance.
/// Dropping the manager terminates the loop and joins its thread.
pub struct SelectorManager {
    inner: Arc<Inner>,
    /// Handed to the loop thread on `start`.
    poller: Mutex<Option<Box<dyn Poller>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SelectorManager {
    /// Create a manager over the platform's default poller. Not started.
    pub fn new(config: SelectorConfig) -> Result<Self> {
        let poller = DefaultPoller::new()?;
        Ok(Self::with_poller(config, Box::new(poller)))
    }

    /// Create a manager over a specific poller. Not started.
    pub fn with_poller(config: SelectorConfig, poller: Box<dyn Poller>) -> Self {
        let inner = Arc::new(Inner {
            config,
            intake: SegQueue::new(),
            closes: SegQueue::new(),
            tickets: AtomicU64::new(0),
            notifier: poller.notifier(),
            state: AtomicU8::new(STATE_NEW),
            counters: Counters::default(),
        });
        Self {
            inner,
            poller: Mutex::new(Some(poller)),
            thread: Mutex::new(None),
        }
    }

    /// Terminate and wait for the loop thread to exit.
    pub fn shutdown(&self) {
        self.request_termination();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("selector thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state() == STATE_RUNNING
    }

    pub fn stats(&self) -> SelectorStats {
        let c = &self.inner.counters;
        SelectorStats {
            registrations: c.registrations.load(Ordering::Relaxed),
            completions: c.completions.load(Ordering::Relaxed),
            rejections: c.rejections.load(Ordering::Relaxed),
            cancellations: c.cancellations.load(Ordering::Relaxed),
            wakeups: c.wakeups.load(Ordering::Relaxed),
        }
    }
}

impl Selector for SelectorManager {
    fn register(&self, fd: RawFd, interest: Interest) -> Registration {
        let inner = &self.inner;
        if inner.state() >= STATE_TERMINATING {
            return Registration::failed(KsioError::Cancelled(CancelReason::Shutdown));
        }
        let (completer, reg) = registration();
        inner.intake.push(PendingRegistration {
            ticket: inner.ticket(),
            fd,
            interest,
            completer,
        });
        Counters::bump(&inner.counters.registrations, 1);

        fence(Ordering::SeqCst);
        if inner.state() >= STATE_TERMINATING {
            // The loop may already have done its final drain.
            inner.fail_intake();
            return reg;
        }
        inner.ring();
        reg
    }

    fn notify_closed(&self, fd: RawFd) {
        if self.inner.state() >= STATE_TERMINATING {
            return;
        }
        self.inner.closes.push((self.inner.ticket(), fd));
        self.inner.ring();
    }

    fn start(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if self.inner.state() != STATE_NEW {
            return Ok(());
        }
        let Some(poller) = self.poller.lock().take() else {
            return Ok(());
        };

        let inner = Arc::clone(&self.inner);
        self.inner.state.store(STATE_RUNNING, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || run_loop(inner, poller));
        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn selector thread");
                self.inner.state.store(STATE_TERMINATED, Ordering::SeqCst);
                self.inner.fail_intake();
                Err(e.into())
            }
        }
    }

    fn request_termination(&self) {
        // Serialised with `start` so a never-started manager is cleaned up once.
        let _guard = self.thread.lock();
        let inner = &self.inner;
        match inner.state() {
            STATE_NEW => {
                inner.state.store(STATE_TERMINATING, Ordering::SeqCst);
                drop(self.poller.lock().take());
                fence(Ordering::SeqCst);
                inner.fail_intake();
                while inner.closes.pop().is_some() {}
                inner.state.store(STATE_TERMINATED, Ordering::SeqCst);
                tracing::debug!("selector terminated before start");
            }
            STATE_RUNNING => {
                inner.state.store(STATE_TERMINATING, Ordering::SeqCst);
                inner.ring();
                tracing::debug!("selector termination requested");
            }
            _ => {}
        }
    }

    fn is_terminated(&self) -> bool {
        self.inner.state() == STATE_TERMINATED
    }
}

impl Drop for SelectorManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Wait loop
// ============================================================================

/// Waiters of one descriptor, indexed by [`Interest::index`].
#[derive(Default)]
struct Slots {
    waiters: [Option<Completer>; 4],
    /// What the OS currently watches for this descriptor.
    os: InterestSet,
}

impl Slots {
    fn wanted(&self) -> InterestSet {
        let mut set = InterestSet::EMPTY;
        for interest in Interest::ALL {
            if self.waiters[interest.index()].is_some() {
                set.add(interest);
            }
        }
        set
    }

    fn prune_abandoned(&mut self) {
        for slot in self.waiters.iter_mut() {
            if slot.as_ref().is_some_and(Completer::is_abandoned) {
                *slot = None;
            }
        }
    }

    /// Fail every waiter; returns how many there were.
    fn fail_all(self, err: &KsioError) -> u64 {
        let mut n = 0;
        for completer in self.waiters.into_iter().flatten() {
            completer.fail(err.clone());
            n += 1;
        }
        n
    }
}

enum Queued {
    Close { ticket: u64, fd: RawFd },
    Register(PendingRegistration),
}

impl Queued {
    fn ticket(&self) -> u64 {
        match self {
            Queued::Close { ticket, .. } => *ticket,
            Queued::Register(pending) => pending.ticket,
        }
    }
}

struct Table {
    fds: HashMap<RawFd, Slots>,
    touched: Vec<RawFd>,
}

impl Table {
    fn insert(&mut self, inner: &Inner, pending: PendingRegistration) {
        let PendingRegistration { fd, interest, completer, .. } = pending;
        let slots = self.fds.entry(fd).or_default();
        let slot = &mut slots.waiters[interest.index()];
        match slot {
            Some(live) if !live.is_abandoned() => {
                tracing::debug!(fd, %interest, "duplicate registration rejected");
                completer.fail(KsioError::DuplicateRegistration { fd, interest });
                Counters::bump(&inner.counters.rejections, 1);
            }
            _ => *slot = Some(completer),
        }
        self.touched.push(fd);
    }

    fn close(&mut self, inner: &Inner, poller: &mut dyn Poller, fd: RawFd) {
        let Some(slots) = self.fds.remove(&fd) else {
            return;
        };
        if !slots.os.is_empty() {
            if let Err(e) = poller.unwatch(fd) {
                tracing::debug!(fd, error = %e, "unwatch of closed descriptor failed");
            }
        }
        let n = slots.fail_all(&KsioError::Cancelled(CancelReason::Closed));
        Counters::bump(&inner.counters.cancellations, n);
    }

    fn dispatch(&mut self, inner: &Inner, event: ReadyEvent) {
        let Some(slots) = self.fds.get_mut(&event.fd) else {
            return;
        };
        let mut n = 0;
        for interest in Interest::ALL {
            if interest.is_satisfied_by(event.ready) {
                if let Some(completer) = slots.waiters[interest.index()].take() {
                    completer.complete();
                    n += 1;
                }
            }
        }
        Counters::bump(&inner.counters.completions, n);
        self.touched.push(event.fd);
    }

    /// Bring the OS watch set of every touched descriptor in line with its waiters.
    fn sync(&mut self, inner: &Inner, poller: &mut dyn Poller) {
        for fd in std::mem::take(&mut self.touched) {
            let Some(slots) = self.fds.get_mut(&fd) else {
                continue;
            };
            slots.prune_abandoned();
            let wanted = slots.wanted();
            if wanted == slots.os {
                if wanted.is_empty() {
                    self.fds.remove(&fd);
                }
                continue;
            }
            if wanted.is_empty() {
                if let Err(e) = poller.unwatch(fd) {
                    tracing::debug!(fd, error = %e, "unwatch failed");
                }
                self.fds.remove(&fd);
                continue;
            }
            if let Err(e) = poller.watch(fd, wanted) {
                tracing::debug!(fd, error = %e, "OS refused to watch descriptor");
                if let Some(slots) = self.fds.remove(&fd) {
                    if !slots.os.is_empty() {
                        let _ = poller.unwatch(fd);
                    }
                    let n = slots.fail_all(&e);
                    Counters::bump(&inner.counters.cancellations, n);
                }
                continue;
            }
            slots.os = wanted;
        }
    }

    /// Apply everything queued by callers, in ticket order.
    fn apply_queued(&mut self, inner: &Inner, poller: &mut dyn Poller, batch: &mut Vec<Queued>) {
        while let Some((ticket, fd)) = inner.closes.pop() {
            batch.push(Queued::Close { ticket, fd });
        }
        while let Some(pending) = inner.intake.pop() {
            batch.push(Queued::Register(pending));
        }
        batch.sort_unstable_by_key(Queued::ticket);
        for op in batch.drain(..) {
            match op {
                Queued::Close { fd, .. } => self.close(inner, poller, fd),
                Queued::Register(pending) => self.insert(inner, pending),
            }
        }
    }

    /// Fail and unwatch everything left at termination.
    fn teardown(&mut self, inner: &Inner, poller: &mut dyn Poller, cause: &KsioError) {
        let mut n = 0;
        for (fd, slots) in self.fds.drain() {
            if !slots.os.is_empty() {
                let _ = poller.unwatch(fd);
            }
            n += slots.fail_all(cause);
        }
        Counters::bump(&inner.counters.cancellations, n);
    }
}

fn run_loop(inner: Arc<Inner>, mut poller: Box<dyn Poller>) {
    let max_events = inner.config.max_events;
    let mut table = Table {
        fds: HashMap::new(),
        touched: Vec::new(),
    };
    let mut events: Vec<ReadyEvent> = Vec::with_capacity(max_events);
    let mut batch: Vec<Queued> = Vec::new();
    let mut cause = KsioError::Cancelled(CancelReason::Shutdown);

    tracing::info!(backend = poller.name(), max_events, "selector started");

    loop {
        if inner.state() >= STATE_TERMINATING {
            break;
        }
        table.apply_queued(&inner, poller.as_mut(), &mut batch);
        table.sync(&inner, poller.as_mut());

        events.clear();
        if let Err(e) = poller.wait(&mut events, max_events) {
            tracing::error!(error = %e, backend = poller.name(), "poller wait failed, terminating");
            inner.state.store(STATE_TERMINATING, Ordering::SeqCst);
            cause = e;
            break;
        }
        Counters::bump(&inner.counters.wakeups, 1);

        // Closes first: a readiness report must not complete a waiter of a
        // descriptor that was already closed.
        table.apply_queued(&inner, poller.as_mut(), &mut batch);
        for event in events.drain(..) {
            table.dispatch(&inner, event);
        }
        table.sync(&inner, poller.as_mut());
    }

    fence(Ordering::SeqCst);
    while let Some(pending) = inner.intake.pop() {
        pending.completer.fail(cause.clone());
        Counters::bump(&inner.counters.cancellations, 1);
    }
    while inner.closes.pop().is_some() {}
    table.teardown(&inner, poller.as_mut(), &cause);
    drop(poller);
    inner.state.store(STATE_TERMINATED, Ordering::SeqCst);
    tracing::info!("selector terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll_poller::PollPoller;
    use futures::executor::block_on;
    use futures::FutureExt;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    fn managers() -> Vec<SelectorManager> {
        let mut out = vec![SelectorManager::with_poller(
            SelectorConfig::default().thread_name("test-poll"),
            Box::new(PollPoller::new().unwrap()),
        )];
        out.push(SelectorManager::new(SelectorConfig::default().thread_name("test-default")).unwrap());
        for m in &out {
            m.start().unwrap();
        }
        out
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_read_readiness_completes_registration() {
        for selector in managers() {
            let (mut a, b) = UnixStream::pair().unwrap();
            let reg = selector.register(b.as_raw_fd(), Interest::Read);
            a.write_all(b"wake").unwrap();
            block_on(reg).unwrap();
            wait_until(|| selector.stats().completions == 1);
        }
    }

    #[test]
    fn test_write_readiness_is_immediate() {
        for selector in managers() {
            let (_a, b) = UnixStream::pair().unwrap();
            block_on(selector.register(b.as_raw_fd(), Interest::Write)).unwrap();
        }
    }

    #[test]
    fn test_hangup_completes_read_interest() {
        for selector in managers() {
            let (a, b) = UnixStream::pair().unwrap();
            let reg = selector.register(b.as_raw_fd(), Interest::Read);
            drop(a);
            block_on(reg).unwrap();
        }
    }

    #[test]
    fn test_independent_interests_on_one_descriptor() {
        for selector in managers() {
            let (mut a, b) = UnixStream::pair().unwrap();
            let fd = b.as_raw_fd();
            let mut read = selector.register(fd, Interest::Read);
            block_on(selector.register(fd, Interest::Write)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            assert!((&mut read).now_or_never().is_none());
            a.write_all(b"x").unwrap();
            block_on(read).unwrap();
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        for selector in managers() {
            let (mut a, b) = UnixStream::pair().unwrap();
            let fd = b.as_raw_fd();
            let first = selector.register(fd, Interest::Read);
            let second = selector.register(fd, Interest::Read);
            match block_on(second) {
                Err(KsioError::DuplicateRegistration { fd: got, interest }) => {
                    assert_eq!(got, fd);
                    assert_eq!(interest, Interest::Read);
                }
                other => panic!("expected duplicate rejection, got {:?}", other),
            }
            a.write_all(b"x").unwrap();
            block_on(first).unwrap();
            wait_until(|| selector.stats().rejections == 1);
        }
    }

    #[test]
    fn test_abandoned_registration_can_be_replaced() {
        for selector in managers() {
            let (mut a, b) = UnixStream::pair().unwrap();
            let fd = b.as_raw_fd();
            drop(selector.register(fd, Interest::Read));
            let again = selector.register(fd, Interest::Read);
            a.write_all(b"x").unwrap();
            block_on(again).unwrap();
        }
    }

    #[test]
    fn test_notify_closed_cancels_waiters() {
        for selector in managers() {
            let (_a, b) = UnixStream::pair().unwrap();
            let fd = b.as_raw_fd();
            let read = selector.register(fd, Interest::Read);
            selector.notify_closed(fd);
            let err = block_on(read).unwrap_err();
            assert_eq!(err.cancel_reason(), Some(CancelReason::Closed));
        }
    }

    #[test]
    fn test_termination_fails_pending_and_later_registrations() {
        for selector in managers() {
            let (_a, b) = UnixStream::pair().unwrap();
            let pending = selector.register(b.as_raw_fd(), Interest::Read);
            selector.shutdown();
            assert!(selector.is_terminated());

            let err = block_on(pending).unwrap_err();
            assert_eq!(err.cancel_reason(), Some(CancelReason::Shutdown));
            let err = block_on(selector.register(b.as_raw_fd(), Interest::Write)).unwrap_err();
            assert_eq!(err.cancel_reason(), Some(CancelReason::Shutdown));

            // Idempotent.
            selector.request_termination();
            selector.shutdown();
        }
    }

    #[test]
    fn test_termination_without_start() {
        let selector = SelectorManager::with_poller(
            SelectorConfig::default(),
            Box::new(PollPoller::new().unwrap()),
        );
        let (_a, b) = UnixStream::pair().unwrap();
        let queued = selector.register(b.as_raw_fd(), Interest::Read);
        selector.request_termination();
        assert!(selector.is_terminated());
        assert!(block_on(queued).unwrap_err().is_cancellation());
        // Starting afterwards does nothing.
        selector.start().unwrap();
        assert!(!selector.is_running());
    }

    #[test]
    fn test_registration_racing_termination_never_hangs() {
        let selector = Arc::new(SelectorManager::new(SelectorConfig::default()).unwrap());
        selector.start().unwrap();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        let registrar = {
            let selector = Arc::clone(&selector);
            std::thread::spawn(move || {
                (0..2000)
                    .map(|i| {
                        let interest = if i % 2 == 0 { Interest::Read } else { Interest::Accept };
                        selector.register(fd, interest)
                    })
                    .collect::<Vec<_>>()
            })
        };
        std::thread::sleep(Duration::from_millis(1));
        selector.request_termination();
        let regs = registrar.join().unwrap();
        selector.shutdown();
        for reg in regs {
            // Each one resolves: duplicate, shutdown, or (never) readiness.
            assert!(block_on(reg).is_err());
        }
    }

    #[test]
    fn test_drop_joins_loop() {
        let selector = SelectorManager::new(SelectorConfig::default()).unwrap();
        selector.start().unwrap();
        selector.start().unwrap();
        assert!(selector.is_running());
        drop(selector);
    }
}
