//! Bounded byte pipe with backpressure
//!
//! A pipe connects one producer and one consumer of a byte stream through a
//! fixed-capacity ring buffer. A writer that finds the ring full suspends
//! until a reader drains it; a reader that finds nothing visible suspends
//! until bytes are flushed or the pipe closes.
//!
//! ```text
//!  read_pos        flush_pos        write_pos        read_pos + capacity
//!     │ visible to reader │ accepted, unflushed │ free space      │
//!     ▼───────────────────▼─────────────────────▼─────────────────▼
//! ```
//!
//! # Locking
//!
//! One mutex guards the cursors, the flags and both wait queues, so "is there
//! room/data" and "park myself" happen atomically. The lock is never held
//! while bytes are copied and never held while a waker runs: an operation
//! reserves a region under the lock, copies outside it, then commits.
//! Reserved regions cannot overlap because only one read and one write may be
//! in flight at a time; a second concurrent read (or write) is rejected with
//! [`KsioError::ConcurrentOperation`].

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::io::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;

use crate::config::PipeConfig;
use crate::error::{CancelReason, KsioError, PipeOp, Result};

/// Upper bound for the scratch buffer used by [`PipeReader::copy_to`].
const COPY_CHUNK: usize = 8192;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_op_id() -> u64 {
    NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Result of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// The write side closed and every buffered byte was delivered.
    EndOfStream,
}

impl ReadOutcome {
    /// Bytes delivered (0 for end-of-stream).
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            ReadOutcome::Data(n) => n,
            ReadOutcome::EndOfStream => 0,
        }
    }

    #[inline]
    pub fn is_end_of_stream(self) -> bool {
        matches!(self, ReadOutcome::EndOfStream)
    }
}

/// Create a pipe and return its two ends.
///
/// # Panics
///
/// Panics if `config.capacity` is zero.
pub fn pipe(config: PipeConfig) -> (PipeWriter, PipeReader) {
    assert!(config.capacity > 0, "pipe capacity must be at least 1");
    let shared = Arc::new(Shared::new(config));
    (
        PipeWriter::from_shared(Arc::clone(&shared)),
        PipeReader::from_shared(shared),
    )
}

// ============================================================================
// Shared state
// ============================================================================

struct Waiter {
    op: u64,
    waker: Waker,
}

struct State {
    read_pos: u64,
    flush_pos: u64,
    write_pos: u64,
    /// Bytes handed to readers (survives the discard on cancel).
    consumed: u64,
    closed: bool,
    failure: Option<KsioError>,
    active_read: Option<u64>,
    active_write: Option<u64>,
    pending_readers: VecDeque<Waiter>,
    pending_writers: VecDeque<Waiter>,
}

impl State {
    fn new() -> Self {
        Self {
            read_pos: 0,
            flush_pos: 0,
            write_pos: 0,
            consumed: 0,
            closed: false,
            failure: None,
            active_read: None,
            active_write: None,
            pending_readers: VecDeque::new(),
            pending_writers: VecDeque::new(),
        }
    }

    #[inline]
    fn buffered(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    #[inline]
    fn visible(&self) -> usize {
        (self.flush_pos - self.read_pos) as usize
    }

    /// Make every accepted byte visible. Returns true if anything changed.
    #[inline]
    fn publish(&mut self) -> bool {
        if self.flush_pos == self.write_pos {
            return false;
        }
        self.flush_pos = self.write_pos;
        true
    }

    fn begin(active: &mut Option<u64>, op: u64, kind: PipeOp) -> Result<()> {
        match *active {
            Some(current) if current != op => Err(KsioError::ConcurrentOperation(kind)),
            _ => {
                *active = Some(op);
                Ok(())
            }
        }
    }

    fn park(queue: &mut VecDeque<Waiter>, op: u64, waker: &Waker) {
        match queue.iter_mut().find(|w| w.op == op) {
            Some(waiter) => {
                if !waiter.waker.will_wake(waker) {
                    waiter.waker = waker.clone();
                }
            }
            None => queue.push_back(Waiter { op, waker: waker.clone() }),
        }
    }

    fn unpark(queue: &mut VecDeque<Waiter>, op: u64) {
        queue.retain(|w| w.op != op);
    }

    #[inline]
    fn check_invariants(&self, capacity: usize) {
        debug_assert!(self.read_pos <= self.flush_pos);
        debug_assert!(self.flush_pos <= self.write_pos);
        debug_assert!(self.write_pos <= self.read_pos + capacity as u64);
    }
}

struct Shared {
    buf: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    auto_flush: bool,
    state: Mutex<State>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

// Safety: the ring is only touched inside regions reserved under `state`.
// The active reader owns [read_pos, read_pos + n) and the active writer owns
// [write_pos, write_pos + m); these never overlap since m <= capacity - buffered.
unsafe impl Sync for Shared {}

impl Shared {
    fn new(config: PipeConfig) -> Self {
        let buf = std::iter::repeat_with(|| UnsafeCell::new(0u8))
            .take(config.capacity)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            capacity: config.capacity,
            auto_flush: config.auto_flush,
            state: Mutex::new(State::new()),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        }
    }

    /// Copy `src` into the ring starting at cursor `pos`.
    ///
    /// # Safety
    /// The caller must own the region `[pos, pos + src.len())`.
    unsafe fn copy_in(&self, pos: u64, src: &[u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = src.len().min(self.capacity - start);
        let base = UnsafeCell::raw_get(self.buf.as_ptr());
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        if first < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Copy bytes out of the ring starting at cursor `pos`.
    ///
    /// # Safety
    /// The caller must own the region `[pos, pos + dst.len())`.
    unsafe fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = dst.len().min(self.capacity - start);
        let base = UnsafeCell::raw_get(self.buf.as_ptr()) as *const u8;
        ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
        if first < dst.len() {
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    /// One read attempt on behalf of `op`. Parks `waker` when nothing is visible.
    ///
    /// The active-read marker is left set; callers release it with `end_read`.
    fn poll_read_op(
        &self,
        op: u64,
        waker: Option<&Waker>,
        dst: &mut [u8],
    ) -> Poll<Result<ReadOutcome>> {
        let (start, n) = {
            let mut st = self.state.lock();
            if let Some(cause) = &st.failure {
                return Poll::Ready(Err(cause.clone()));
            }
            if let Err(e) = State::begin(&mut st.active_read, op, PipeOp::Read) {
                return Poll::Ready(Err(e));
            }
            if dst.is_empty() {
                return Poll::Ready(Ok(ReadOutcome::Data(0)));
            }
            let visible = st.visible();
            if visible == 0 {
                if st.closed {
                    return Poll::Ready(Ok(ReadOutcome::EndOfStream));
                }
                if let Some(waker) = waker {
                    State::park(&mut st.pending_readers, op, waker);
                }
                return Poll::Pending;
            }
            (st.read_pos, visible.min(dst.len()))
        };

        // Safety: [start, start + n) is published and we are the only active reader.
        unsafe { self.copy_out(start, &mut dst[..n]) };

        let wake = {
            let mut st = self.state.lock();
            if let Some(cause) = &st.failure {
                return Poll::Ready(Err(cause.clone()));
            }
            st.read_pos += n as u64;
            st.consumed += n as u64;
            st.check_invariants(self.capacity);
            State::unpark(&mut st.pending_readers, op);
            st.pending_writers.pop_front()
        };
        if let Some(writer) = wake {
            writer.waker.wake();
        }
        Poll::Ready(Ok(ReadOutcome::Data(n)))
    }

    /// One write attempt on behalf of `op`: accepts as much of `src` as fits.
    ///
    /// Never returns `Ok(0)` for a non-empty `src`; a full ring publishes what
    /// was accepted (so a reader can make room) and parks `waker`.
    fn poll_write_op(&self, op: u64, waker: Option<&Waker>, src: &[u8]) -> Poll<Result<usize>> {
        let (start, n) = {
            let mut st = self.state.lock();
            if let Some(cause) = &st.failure {
                return Poll::Ready(Err(cause.clone()));
            }
            if st.closed {
                return Poll::Ready(Err(KsioError::ClosedForWrite));
            }
            if let Err(e) = State::begin(&mut st.active_write, op, PipeOp::Write) {
                return Poll::Ready(Err(e));
            }
            if src.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let free = self.capacity - st.buffered();
            if free == 0 {
                let reader = if st.publish() { st.pending_readers.pop_front() } else { None };
                if let Some(waker) = waker {
                    State::park(&mut st.pending_writers, op, waker);
                }
                drop(st);
                if let Some(reader) = reader {
                    reader.waker.wake();
                }
                return Poll::Pending;
            }
            (st.write_pos, free.min(src.len()))
        };

        // Safety: [start, start + n) is free space and we are the only active writer.
        unsafe { self.copy_in(start, &src[..n]) };

        let wake = {
            let mut st = self.state.lock();
            if let Some(cause) = &st.failure {
                return Poll::Ready(Err(cause.clone()));
            }
            if st.closed {
                return Poll::Ready(Err(KsioError::ClosedForWrite));
            }
            st.write_pos += n as u64;
            st.check_invariants(self.capacity);
            State::unpark(&mut st.pending_writers, op);
            if self.auto_flush && st.publish() {
                st.pending_readers.pop_front()
            } else {
                None
            }
        };
        if let Some(reader) = wake {
            reader.waker.wake();
        }
        Poll::Ready(Ok(n))
    }

    fn end_read(&self, op: u64) {
        let mut st = self.state.lock();
        if st.active_read == Some(op) {
            st.active_read = None;
        }
        State::unpark(&mut st.pending_readers, op);
    }

    fn end_write(&self, op: u64) {
        let mut st = self.state.lock();
        if st.active_write == Some(op) {
            st.active_write = None;
        }
        State::unpark(&mut st.pending_writers, op);
    }

    fn flush(&self) -> Result<()> {
        let wake = {
            let mut st = self.state.lock();
            if let Some(cause) = &st.failure {
                return Err(cause.clone());
            }
            if st.publish() {
                st.pending_readers.pop_front()
            } else {
                None
            }
        };
        if let Some(reader) = wake {
            reader.waker.wake();
        }
        Ok(())
    }

    fn close(&self) {
        let (readers, writers) = {
            let mut st = self.state.lock();
            if st.closed || st.failure.is_some() {
                return;
            }
            st.closed = true;
            st.publish();
            (
                mem::take(&mut st.pending_readers),
                mem::take(&mut st.pending_writers),
            )
        };
        tracing::trace!(capacity = self.capacity, "pipe closed for write");
        for waiter in readers.into_iter().chain(writers) {
            waiter.waker.wake();
        }
    }

    fn cancel(&self, cause: KsioError) {
        let (readers, writers) = {
            let mut st = self.state.lock();
            if st.failure.is_some() {
                return;
            }
            tracing::trace!(cause = %cause, discarded = st.buffered(), "pipe cancelled");
            st.failure = Some(cause);
            st.closed = true;
            // Discard: nothing buffered is ever delivered after this point.
            st.read_pos = st.write_pos;
            st.flush_pos = st.write_pos;
            (
                mem::take(&mut st.pending_readers),
                mem::take(&mut st.pending_writers),
            )
        };
        for waiter in readers.into_iter().chain(writers) {
            waiter.waker.wake();
        }
    }

    fn closed_cause(&self) -> Option<KsioError> {
        self.state.lock().failure.clone()
    }
}

// ============================================================================
// Read end
// ============================================================================

/// Read end of a pipe.
///
/// Cloning yields another handle to the same end. Only one read may be in
/// flight at a time across all handles: a second concurrent read fails with
/// [`KsioError::ConcurrentOperation`] and leaves the first untouched.
///
/// Dropping the last reader of a pipe that is still open cancels it with
/// [`CancelReason::Closed`], so writers never wait for a consumer that is gone.
pub struct PipeReader {
    shared: Arc<Shared>,
    /// Operation id used by the `AsyncRead` impl.
    op: u64,
}

impl PipeReader {
    fn from_shared(shared: Arc<Shared>) -> Self {
        shared.readers.fetch_add(1, Ordering::AcqRel);
        Self { shared, op: next_op_id() }
    }

    /// Read available bytes into `buf`, suspending while the pipe is empty.
    ///
    /// Resolves to [`ReadOutcome::Data`] with the number of bytes copied, or
    /// [`ReadOutcome::EndOfStream`] once the pipe is closed and drained.
    pub fn read<'a>(&'a self, buf: &'a mut [u8]) -> PipeRead<'a> {
        PipeRead {
            shared: &self.shared,
            buf,
            op: next_op_id(),
            done: false,
        }
    }

    /// Read without suspending. `Ok(None)` means the call would have suspended.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<ReadOutcome>> {
        let op = next_op_id();
        let res = self.shared.poll_read_op(op, None, buf);
        self.shared.end_read(op);
        match res {
            Poll::Ready(r) => r.map(Some),
            Poll::Pending => Ok(None),
        }
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                ReadOutcome::Data(n) => filled += n,
                ReadOutcome::EndOfStream => return Err(KsioError::UnexpectedEof),
            }
        }
        Ok(())
    }

    /// Move every byte of this pipe into `dst` until end-of-stream.
    ///
    /// `dst` is flushed whenever this pipe runs dry and at the end. Returns
    /// the number of bytes copied. `dst` is not closed.
    pub async fn copy_to(&self, dst: &PipeWriter) -> Result<u64> {
        let mut chunk = vec![0u8; self.shared.capacity.min(COPY_CHUNK)];
        let mut total = 0u64;
        loop {
            match self.read(&mut chunk).await? {
                ReadOutcome::Data(n) => {
                    dst.write(&chunk[..n]).await?;
                    total += n as u64;
                    if self.available_for_read() == 0 {
                        dst.flush()?;
                    }
                }
                ReadOutcome::EndOfStream => {
                    dst.flush()?;
                    return Ok(total);
                }
            }
        }
    }

    /// Close the pipe for write; buffered bytes remain readable.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Cancel the pipe: discard buffered bytes and fail every operation with `cause`.
    pub fn cancel(&self, cause: KsioError) {
        self.shared.cancel(cause);
    }

    /// Bytes that a read would deliver right now.
    pub fn available_for_read(&self) -> usize {
        let st = self.shared.state.lock();
        if st.failure.is_some() {
            0
        } else {
            st.visible()
        }
    }

    /// True once end-of-stream has been reached or the pipe was cancelled.
    pub fn is_closed_for_read(&self) -> bool {
        let st = self.shared.state.lock();
        st.failure.is_some() || (st.closed && st.visible() == 0)
    }

    /// True once the write side is closed (gracefully or by cancel).
    pub fn is_closed_for_write(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The terminal cause, if the pipe was cancelled.
    pub fn closed_cause(&self) -> Option<KsioError> {
        self.shared.closed_cause()
    }

    /// Total bytes delivered to readers.
    pub fn total_bytes_read(&self) -> u64 {
        self.shared.state.lock().consumed
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Clone for PipeReader {
    fn clone(&self) -> Self {
        PipeReader::from_shared(Arc::clone(&self.shared))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.end_read(self.op);
        if self.shared.readers.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.shared.state.lock().closed
        {
            self.shared.cancel(KsioError::Cancelled(CancelReason::Closed));
        }
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available_for_read())
            .field("closed_for_read", &self.is_closed_for_read())
            .finish()
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.shared.poll_read_op(this.op, Some(cx.waker()), buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                this.shared.end_read(this.op);
                Poll::Ready(match res {
                    Ok(outcome) => Ok(outcome.bytes()),
                    Err(e) => Err(e.into()),
                })
            }
        }
    }
}

/// Future returned by [`PipeReader::read`].
///
/// Dropping it while pending removes it from the wait queue and frees the
/// reader slot; the pipe itself is unaffected.
pub struct PipeRead<'a> {
    shared: &'a Shared,
    buf: &'a mut [u8],
    op: u64,
    done: bool,
}

impl Future for PipeRead<'_> {
    type Output = Result<ReadOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let res = this.shared.poll_read_op(this.op, Some(cx.waker()), this.buf);
        if res.is_ready() {
            this.shared.end_read(this.op);
            this.done = true;
        }
        res
    }
}

impl Drop for PipeRead<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.end_read(self.op);
        }
    }
}

// ============================================================================
// Write end
// ============================================================================

/// Write end of a pipe.
///
/// Written bytes become visible to readers on [`flush`](Self::flush), on
/// [`close`](Self::close), whenever the ring fills up, or immediately when
/// the pipe was created with `auto_flush`.
///
/// Dropping the last writer closes the pipe gracefully.
pub struct PipeWriter {
    shared: Arc<Shared>,
    /// Operation id used by the `AsyncWrite` impl.
    op: u64,
}

impl PipeWriter {
    fn from_shared(shared: Arc<Shared>) -> Self {
        shared.writers.fetch_add(1, Ordering::AcqRel);
        Self { shared, op: next_op_id() }
    }

    /// Write all of `src`, suspending while the ring is full.
    pub fn write<'a>(&'a self, src: &'a [u8]) -> PipeWrite<'a> {
        PipeWrite {
            shared: &self.shared,
            src,
            written: 0,
            op: next_op_id(),
            done: false,
        }
    }

    /// Accept as much of `src` as fits right now, without suspending.
    pub fn try_write(&self, src: &[u8]) -> Result<usize> {
        let op = next_op_id();
        let res = self.shared.poll_write_op(op, None, src);
        self.shared.end_write(op);
        match res {
            Poll::Ready(r) => r,
            Poll::Pending => Ok(0),
        }
    }

    /// Make every accepted byte visible to readers.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Close for write: flushes, then readers drain and observe end-of-stream.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Cancel the pipe: discard buffered bytes and fail every operation with `cause`.
    pub fn cancel(&self, cause: KsioError) {
        self.shared.cancel(cause);
    }

    /// Free space in the ring (0 once closed).
    pub fn available_for_write(&self) -> usize {
        let st = self.shared.state.lock();
        if st.closed {
            0
        } else {
            self.shared.capacity - st.buffered()
        }
    }

    pub fn is_closed_for_write(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// The terminal cause, if the pipe was cancelled.
    pub fn closed_cause(&self) -> Option<KsioError> {
        self.shared.closed_cause()
    }

    /// Total bytes accepted from writers.
    pub fn total_bytes_written(&self) -> u64 {
        self.shared.state.lock().write_pos
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        PipeWriter::from_shared(Arc::clone(&self.shared))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.end_write(self.op);
        if self.shared.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("capacity", &self.shared.capacity)
            .field("free", &self.available_for_write())
            .field("closed", &self.is_closed_for_write())
            .finish()
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.shared.poll_write_op(this.op, Some(cx.waker()), buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                this.shared.end_write(this.op);
                Poll::Ready(res.map_err(Into::into))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shared.flush().map_err(Into::into))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close();
        Poll::Ready(Ok(()))
    }
}

/// Future returned by [`PipeWriter::write`].
///
/// Dropping it while pending keeps whatever prefix was already accepted and
/// frees the writer slot.
pub struct PipeWrite<'a> {
    shared: &'a Shared,
    src: &'a [u8],
    written: usize,
    op: u64,
    done: bool,
}

impl PipeWrite<'_> {
    /// Bytes accepted so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl Future for PipeWrite<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            let rest = &this.src[this.written..];
            match this.shared.poll_write_op(this.op, Some(cx.waker()), rest) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(n)) => {
                    this.written += n;
                    if this.written == this.src.len() {
                        this.shared.end_write(this.op);
                        this.done = true;
                        return Poll::Ready(Ok(()));
                    }
                }
                Poll::Ready(Err(e)) => {
                    this.shared.end_write(this.op);
                    this.done = true;
                    return Poll::Ready(Err(e));
                }
            }
        }
    }
}

impl Drop for PipeWrite<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.end_write(self.op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use futures::task::{noop_waker, waker, ArcWake};
    use proptest::prelude::*;
    use std::thread;

    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let w = waker(Arc::clone(&counter));
        (counter, w)
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F, w: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(w);
        Pin::new(fut).poll(&mut cx)
    }

    fn drain(reader: &PipeReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.try_read(&mut buf).unwrap() {
                Some(ReadOutcome::Data(n)) => out.extend_from_slice(&buf[..n]),
                Some(ReadOutcome::EndOfStream) | None => return out,
            }
        }
    }

    #[test]
    fn test_write_flush_read() {
        let (w, r) = pipe(PipeConfig::new(64));
        block_on(async {
            w.write(b"hello").await.unwrap();
            w.flush().unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::Data(5));
            assert_eq!(&buf[..5], b"hello");
        });
        assert_eq!(w.total_bytes_written(), 5);
        assert_eq!(r.total_bytes_read(), 5);
    }

    #[test]
    fn test_unflushed_bytes_are_invisible() {
        let (w, r) = pipe(PipeConfig::new(64));
        assert_eq!(w.try_write(b"abc").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(r.try_read(&mut buf).unwrap(), None);
        assert_eq!(r.available_for_read(), 0);

        w.flush().unwrap();
        assert_eq!(r.available_for_read(), 3);
        assert_eq!(r.try_read(&mut buf).unwrap(), Some(ReadOutcome::Data(3)));
    }

    #[test]
    fn test_auto_flush_publishes_each_write() {
        let (w, r) = pipe(PipeConfig::new(64).auto_flush(true));
        w.try_write(b"xy").unwrap();
        assert_eq!(r.available_for_read(), 2);
    }

    #[test]
    fn test_backpressure_scenario() {
        // Capacity 8, 20 bytes written with no reader: the writer suspends after
        // 8, each drain lets the suspended write continue, nothing is lost.
        let (w, r) = pipe(PipeConfig::new(8));
        let data: Vec<u8> = (0u8..20).collect();
        let nw = noop_waker();

        let mut write = w.write(&data);
        assert!(poll_once(&mut write, &nw).is_pending());
        assert_eq!(write.written(), 8);
        assert_eq!(r.available_for_read(), 8);
        assert_eq!(w.available_for_write(), 0);

        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        assert_eq!(r.try_read(&mut buf).unwrap(), Some(ReadOutcome::Data(5)));
        out.extend_from_slice(&buf);

        assert!(poll_once(&mut write, &nw).is_pending());
        assert_eq!(write.written(), 13);

        loop {
            if let Poll::Ready(res) = poll_once(&mut write, &nw) {
                res.unwrap();
                break;
            }
            if let Some(ReadOutcome::Data(n)) = r.try_read(&mut buf).unwrap() {
                out.extend_from_slice(&buf[..n]);
            }
        }
        drop(write);
        w.close();
        out.extend(drain(&r));

        assert_eq!(out, data);
        assert!(r.is_closed_for_read());
        assert_eq!(r.try_read(&mut buf).unwrap(), Some(ReadOutcome::EndOfStream));
    }

    #[test]
    fn test_pending_writer_resumed_by_reader() {
        let (w, r) = pipe(PipeConfig::new(4));
        let (count, cw) = counting();

        let data = [1u8; 6];
        let mut write = w.write(&data);
        assert!(poll_once(&mut write, &cw).is_pending());
        assert_eq!(count.0.load(Ordering::SeqCst), 0);

        let mut buf = [0u8; 2];
        r.try_read(&mut buf).unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        assert!(poll_once(&mut write, &cw).is_ready());
    }

    #[test]
    fn test_one_reader_woken_per_flush() {
        let (w, r) = pipe(PipeConfig::new(16));
        let (count, cw) = counting();
        let mut buf = [0u8; 4];
        let mut read = r.read(&mut buf);
        assert!(poll_once(&mut read, &cw).is_pending());

        w.try_write(b"ab").unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
        w.flush().unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        // Nothing new to publish, nobody else to wake.
        w.flush().unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        assert!(matches!(
            poll_once(&mut read, &cw),
            Poll::Ready(Ok(ReadOutcome::Data(2)))
        ));
    }

    #[test]
    fn test_close_drains_then_end_of_stream() {
        let (w, r) = pipe(PipeConfig::new(16));
        block_on(async {
            w.write(b"tail").await.unwrap();
            w.close();
            assert!(matches!(w.write(b"x").await, Err(KsioError::ClosedForWrite)));

            let mut buf = [0u8; 2];
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::Data(2));
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::Data(2));
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::EndOfStream);
            assert_eq!(r.read(&mut buf).await.unwrap(), ReadOutcome::EndOfStream);
        });
    }

    #[test]
    fn test_close_wakes_pending_reader() {
        let (w, r) = pipe(PipeConfig::new(16));
        let (count, cw) = counting();
        let mut buf = [0u8; 4];
        let mut read = r.read(&mut buf);
        assert!(poll_once(&mut read, &cw).is_pending());

        w.close();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            poll_once(&mut read, &cw),
            Poll::Ready(Ok(ReadOutcome::EndOfStream))
        ));
    }

    #[test]
    fn test_reader_close_fails_suspended_writer() {
        let (w, r) = pipe(PipeConfig::new(4));
        let (count, cw) = counting();

        let data = [3u8; 6];
        let mut write = w.write(&data);
        assert!(poll_once(&mut write, &cw).is_pending());
        assert_eq!(write.written(), 4);

        r.close();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            poll_once(&mut write, &cw),
            Poll::Ready(Err(KsioError::ClosedForWrite))
        ));
        drop(write);

        // Bytes accepted before the close are still delivered.
        assert!(r.is_closed_for_write());
        assert_eq!(drain(&r), [3u8; 4]);
        assert!(r.is_closed_for_read());
    }

    #[test]
    fn test_cancel_fails_everything_and_discards() {
        let (w, r) = pipe(PipeConfig::new(4));
        let (count, cw) = counting();

        // A writer suspended on a full ring, with 4 unread bytes buffered.
        let data = [9u8; 6];
        let mut write = w.write(&data);
        assert!(poll_once(&mut write, &cw).is_pending());
        assert_eq!(r.available_for_read(), 4);

        let cause: KsioError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        r.cancel(cause);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        match poll_once(&mut write, &cw) {
            Poll::Ready(Err(e)) => assert_eq!(e.io_kind(), Some(io::ErrorKind::ConnectionReset)),
            other => panic!("unexpected {:?}", other),
        }
        drop(write);

        let mut buf = [0u8; 4];
        let err = r.try_read(&mut buf).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionReset));
        assert_eq!(buf, [0u8; 4]);
        assert!(w.flush().is_err());
        assert!(w.try_write(b"z").is_err());

        // First cause wins.
        w.cancel(KsioError::Cancelled(CancelReason::Aborted));
        assert_eq!(
            r.closed_cause().and_then(|e| e.io_kind()),
            Some(io::ErrorKind::ConnectionReset)
        );
        assert_eq!(r.available_for_read(), 0);
        assert!(r.is_closed_for_read());
    }

    #[test]
    fn test_cancel_wakes_pending_reader_with_cause() {
        let (w, r) = pipe(PipeConfig::new(8));
        let nw = noop_waker();
        let mut buf = [0u8; 4];
        let mut read = r.read(&mut buf);
        assert!(poll_once(&mut read, &nw).is_pending());

        w.cancel(KsioError::Cancelled(CancelReason::Shutdown));
        match poll_once(&mut read, &nw) {
            Poll::Ready(Err(e)) => assert_eq!(e.cancel_reason(), Some(CancelReason::Shutdown)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_read_is_rejected() {
        let (_w, r) = pipe(PipeConfig::new(8));
        let other = r.clone();
        let nw = noop_waker();

        let mut first_buf = [0u8; 4];
        let mut first = r.read(&mut first_buf);
        assert!(poll_once(&mut first, &nw).is_pending());

        let mut second_buf = [0u8; 4];
        let mut second = other.read(&mut second_buf);
        match poll_once(&mut second, &nw) {
            Poll::Ready(Err(KsioError::ConcurrentOperation(PipeOp::Read))) => {}
            other => panic!("expected rejection, got {:?}", other),
        }
        // The first read is still the active one.
        assert!(poll_once(&mut first, &nw).is_pending());
    }

    #[test]
    fn test_concurrent_write_is_rejected() {
        let (w, _r) = pipe(PipeConfig::new(2));
        let other = w.clone();
        let nw = noop_waker();

        let data = [0u8; 4];
        let mut first = w.write(&data);
        assert!(poll_once(&mut first, &nw).is_pending());
        assert!(matches!(
            other.try_write(b"x"),
            Err(KsioError::ConcurrentOperation(PipeOp::Write))
        ));
    }

    #[test]
    fn test_dropped_read_frees_slot_without_side_effects() {
        let (w, r) = pipe(PipeConfig::new(8));
        let nw = noop_waker();
        {
            let mut buf = [0u8; 4];
            let mut read = r.read(&mut buf);
            assert!(poll_once(&mut read, &nw).is_pending());
        }
        assert!(r.closed_cause().is_none());
        assert!(!r.is_closed_for_write());

        w.try_write(b"ok").unwrap();
        w.flush().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(r.clone().try_read(&mut buf).unwrap(), Some(ReadOutcome::Data(2)));
    }

    #[test]
    fn test_last_writer_drop_closes() {
        let (w, r) = pipe(PipeConfig::new(8));
        let w2 = w.clone();
        w.try_write(b"abc").unwrap();
        drop(w);
        assert!(!r.is_closed_for_write());
        drop(w2);
        assert!(r.is_closed_for_write());
        assert_eq!(drain(&r), b"abc");
        assert!(r.is_closed_for_read());
    }

    #[test]
    fn test_last_reader_drop_cancels_open_pipe() {
        let (w, r) = pipe(PipeConfig::new(8));
        drop(r);
        match w.try_write(b"x") {
            Err(e) => assert_eq!(e.cancel_reason(), Some(CancelReason::Closed)),
            Ok(n) => panic!("write accepted {} bytes", n),
        }
    }

    #[test]
    fn test_empty_buffers() {
        let (w, r) = pipe(PipeConfig::new(8));
        assert_eq!(w.try_write(&[]).unwrap(), 0);
        assert_eq!(r.try_read(&mut []).unwrap(), Some(ReadOutcome::Data(0)));
        block_on(w.write(&[])).unwrap();
    }

    #[test]
    fn test_read_exact_and_unexpected_eof() {
        let (w, r) = pipe(PipeConfig::new(8));
        block_on(async {
            w.write(b"0123456").await.unwrap();
            w.close();
            let mut head = [0u8; 4];
            r.read_exact(&mut head).await.unwrap();
            assert_eq!(&head, b"0123");
            let mut rest = [0u8; 4];
            assert!(matches!(r.read_exact(&mut rest).await, Err(KsioError::UnexpectedEof)));
        });
    }

    #[test]
    fn test_copy_to_between_pipes() {
        let (src_w, src_r) = pipe(PipeConfig::new(8));
        let (dst_w, dst_r) = pipe(PipeConfig::new(8));
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let expected = payload.clone();

        let producer = thread::spawn(move || {
            block_on(async {
                src_w.write(&payload).await.unwrap();
                src_w.close();
            })
        });
        let copier = thread::spawn(move || {
            let n = block_on(src_r.copy_to(&dst_w)).unwrap();
            dst_w.close();
            n
        });

        let mut got = Vec::new();
        block_on(async {
            let mut buf = [0u8; 3];
            loop {
                match dst_r.read(&mut buf).await.unwrap() {
                    ReadOutcome::Data(n) => got.extend_from_slice(&buf[..n]),
                    ReadOutcome::EndOfStream => break,
                }
            }
        });
        producer.join().unwrap();
        assert_eq!(copier.join().unwrap(), 200);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_async_io_traits() {
        let (mut w, mut r) = pipe(PipeConfig::new(16));
        let writer = thread::spawn(move || {
            block_on(async {
                w.write_all(b"through futures::io").await.unwrap();
                AsyncWriteExt::close(&mut w).await.unwrap();
            })
        });
        let mut out = Vec::new();
        block_on(r.read_to_end(&mut out)).unwrap();
        writer.join().unwrap();
        assert_eq!(out, b"through futures::io");
    }

    #[test]
    fn test_threaded_transfer_preserves_order() {
        let (w, r) = pipe(PipeConfig::new(61));
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = thread::spawn(move || {
            block_on(async {
                for chunk in payload.chunks(97) {
                    w.write(chunk).await.unwrap();
                    w.flush().unwrap();
                }
                w.close();
            })
        });

        let mut got = Vec::with_capacity(expected.len());
        block_on(async {
            let mut buf = [0u8; 13];
            loop {
                match r.read(&mut buf).await.unwrap() {
                    ReadOutcome::Data(n) => got.extend_from_slice(&buf[..n]),
                    ReadOutcome::EndOfStream => break,
                }
            }
        });
        writer.join().unwrap();
        assert_eq!(got, expected);
    }

    proptest! {
        #[test]
        fn prop_any_chunking_preserves_bytes(
            capacity in 1usize..32,
            writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..20),
            read_size in 1usize..17,
        ) {
            let (w, r) = pipe(PipeConfig::new(capacity));
            let expected: Vec<u8> = writes.concat();
            let mut got = Vec::new();
            let mut buf = vec![0u8; read_size];

            for chunk in &writes {
                let mut offset = 0;
                while offset < chunk.len() {
                    offset += w.try_write(&chunk[offset..]).unwrap();
                    w.flush().unwrap();
                    if let Some(ReadOutcome::Data(n)) = r.try_read(&mut buf).unwrap() {
                        got.extend_from_slice(&buf[..n]);
                    }
                }
            }
            w.close();
            loop {
                match r.try_read(&mut buf).unwrap() {
                    Some(ReadOutcome::Data(n)) => got.extend_from_slice(&buf[..n]),
                    Some(ReadOutcome::EndOfStream) => break,
                    None => prop_assert!(false, "closed pipe must not suspend"),
                }
            }
            prop_assert_eq!(got, expected);
        }
    }
}
