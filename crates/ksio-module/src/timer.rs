//! Deadline thread used for timeouts
//!
//! One thread sleeps on a condition variable until the earliest deadline in
//! a min-heap, then wakes the futures whose deadlines passed. Neither pipes
//! nor the selector know about time; timeouts are built by racing a future
//! against a [`Sleep`] ([`Timer::timeout`]).
//!
//! # Cancellation Strategy
//!
//! Lazy: dropping a `Sleep` only flags its entry, which is skipped when it
//! reaches the top of the heap.

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::future::{self, Either};
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex, MutexGuard};

use ksio_core::error::{CancelReason, KsioError, Result};

/// Shared between a `Sleep` and the heap.
struct Deadline {
    fired: AtomicBool,
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

impl Deadline {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Wrapper for heap ordering (min-heap by deadline, FIFO on ties)
struct HeapEntry {
    at: Instant,
    seq: u64,
    deadline: Arc<Deadline>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct HeapState {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<HeapState>,
    cond: Condvar,
}

/// Owner of the deadline thread. Dropping it stops the thread.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start a timer thread named `name`.
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(HeapState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// A future that resolves once `duration` has elapsed.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(Instant::now() + duration)
    }

    /// A future that resolves at `at`.
    ///
    /// After [`shutdown`](Self::shutdown) every sleep resolves immediately.
    pub fn sleep_until(&self, at: Instant) -> Sleep {
        let deadline = Arc::new(Deadline {
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        let mut st = self.shared.state.lock();
        if st.shutdown {
            deadline.fired.store(true, Ordering::Release);
            return Sleep { deadline };
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        let earliest = st.heap.peek().map_or(true, |top| at < top.at);
        st.heap.push(HeapEntry {
            at,
            seq,
            deadline: Arc::clone(&deadline),
        });
        drop(st);
        if earliest {
            self.shared.cond.notify_one();
        }
        Sleep { deadline }
    }

    /// Run `fut` with a deadline.
    ///
    /// On expiry `fut` is dropped (which withdraws whatever wait it was in)
    /// and the result is `Err(Cancelled(Timeout))`.
    pub async fn timeout<T, F>(&self, duration: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let sleep = self.sleep(duration);
        futures::pin_mut!(fut);
        match future::select(fut, sleep).await {
            Either::Left((res, _)) => res,
            Either::Right(((), _)) => Err(KsioError::Cancelled(CancelReason::Timeout)),
        }
    }

    /// Number of deadlines not yet fired (cancelled ones included).
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the thread, firing every pending deadline. Idempotent.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    tracing::debug!("timer thread started");
    let mut due: Vec<Arc<Deadline>> = Vec::new();
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            due.extend(st.heap.drain().map(|e| e.deadline));
            fire_unlocked(&mut st, &mut due);
            break;
        }

        let now = Instant::now();
        while st.heap.peek().is_some_and(|top| top.at <= now) {
            if let Some(entry) = st.heap.pop() {
                if !entry.deadline.cancelled.load(Ordering::Acquire) {
                    due.push(entry.deadline);
                }
            }
        }
        if !due.is_empty() {
            fire_unlocked(&mut st, &mut due);
            continue;
        }

        match st.heap.peek().map(|top| top.at) {
            Some(at) => {
                shared.cond.wait_until(&mut st, at);
            }
            None => shared.cond.wait(&mut st),
        }
    }
    tracing::debug!("timer thread exited");
}

/// Wake everything in `due` with the lock released.
fn fire_unlocked(st: &mut MutexGuard<'_, HeapState>, due: &mut Vec<Arc<Deadline>>) {
    MutexGuard::unlocked(st, || {
        for deadline in due.drain(..) {
            deadline.fire();
        }
    });
}

/// Future returned by [`Timer::sleep`].
pub struct Sleep {
    deadline: Arc<Deadline>,
}

impl Sleep {
    pub fn is_elapsed(&self) -> bool {
        self.deadline.fired.load(Ordering::Acquire)
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_elapsed() {
            return Poll::Ready(());
        }
        self.deadline.waker.register(cx.waker());
        if self.is_elapsed() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.deadline.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use ksio_core::config::PipeConfig;
    use ksio_core::pipe::{pipe, ReadOutcome};

    #[test]
    fn test_sleep_waits_at_least_duration() {
        let timer = Timer::new("test-timer").unwrap();
        let start = Instant::now();
        block_on(timer.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_deadlines_fire_in_order() {
        let timer = Timer::new("test-timer").unwrap();
        let late = timer.sleep(Duration::from_millis(60));
        let early = timer.sleep(Duration::from_millis(10));
        block_on(early);
        assert!(!late.is_elapsed());
        block_on(late);
    }

    #[test]
    fn test_timeout_passes_result_through() {
        let timer = Timer::new("test-timer").unwrap();
        let res = block_on(timer.timeout(Duration::from_secs(5), async { Ok(7) }));
        assert_eq!(res.unwrap(), 7);
    }

    #[test]
    fn test_timeout_cancels_only_the_waiting_read() {
        let timer = Timer::new("test-timer").unwrap();
        let (w, r) = pipe(PipeConfig::new(16));
        let mut buf = [0u8; 4];

        let res = block_on(timer.timeout(Duration::from_millis(20), r.read(&mut buf)));
        assert_eq!(res.unwrap_err().cancel_reason(), Some(CancelReason::Timeout));

        // The pipe is untouched and the reader slot is free again.
        assert!(r.closed_cause().is_none());
        w.try_write(b"late").unwrap();
        w.flush().unwrap();
        assert_eq!(block_on(r.read(&mut buf)).unwrap(), ReadOutcome::Data(4));
        assert_eq!(&buf, b"late");
    }

    #[test]
    fn test_shutdown_releases_sleepers() {
        let timer = Timer::new("test-timer").unwrap();
        let sleep = timer.sleep(Duration::from_secs(3600));
        assert_eq!(timer.pending(), 1);
        timer.shutdown();
        assert!(sleep.is_elapsed());
        assert!(timer.sleep(Duration::from_secs(3600)).is_elapsed());
        timer.shutdown();
    }
}
