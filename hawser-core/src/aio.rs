//! Asynchronous I/O handles.
//!
//! An [`Aio`] is the unit of pending work in hawser: the universal currency
//! between providers (transports, timers, protocols) and consumers. A
//! consumer submits an AIO to an operation; the provider installs a cancel
//! hook via [`Aio::start`] and later completes the operation with exactly
//! one `finish` call. Completion, timeout, abort and stop all funnel into
//! the AIO's task, which runs the user callback exactly once per started
//! operation.
//!
//! AIOs are only ever completed by the provider. Until that happens the
//! provider may assume the AIO is valid; handles are reference counted so
//! queued clones keep the state alive. The cancel hook is taken exactly
//! once: whichever of user abort, deadline expiration, or provider finish
//! first removes it under the locks wins.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::expire::ExpireShard;
use crate::msg::Msg;
use crate::task::Task;

/// Inline transmit segment capacity; sends with more segments are refused.
pub const MAX_IOV: usize = 8;

/// Input/output slot count.
pub const IO_SLOTS: usize = 4;

/// Relative operation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Expire immediately on start.
    Zero,
    /// Never expire.
    #[default]
    Infinite,
    /// Resolved by the provider via [`Aio::normalize_timeout`].
    Default,
    /// Expire after the given duration.
    After(Duration),
}

pub(crate) type CancelFn = Box<dyn FnOnce(&Aio, Error) + Send>;

type Slot = Option<Box<dyn Any + Send>>;

/// One-shot asynchronous operation handle.
///
/// Cheap to clone; all clones refer to the same operation state.
#[derive(Clone)]
pub struct Aio {
    pub(crate) inner: Arc<AioInner>,
}

pub(crate) struct AioInner {
    pub(crate) shard: Arc<ExpireShard>,
    pub(crate) task: Task,
    pub(crate) st: Mutex<AioState>,
}

pub(crate) struct AioState {
    pub(crate) result: Result<()>,
    pub(crate) count: usize,
    iov: SmallVec<[Bytes; MAX_IOV]>,
    rx_want: usize,
    rx_buf: Option<BytesMut>,
    msg: Option<Msg>,
    inputs: [Slot; IO_SLOTS],
    outputs: [Slot; IO_SLOTS],
    prov_data: Slot,
    timeout: Timeout,
    expire_at: Option<Instant>,
    use_expire: bool,
    /// Absolute deadline while scheduled; `None` means never.
    pub(crate) sched_deadline: Option<Instant>,
    pub(crate) cancel: Option<CancelFn>,
    abort: Option<Error>,
    pub(crate) stop_requested: bool,
    pub(crate) expire_ok: bool,
    pub(crate) sleep: bool,
    /// Set while the expiration thread holds a logical pin on this AIO.
    pub(crate) expiring: bool,
}

impl Default for AioState {
    fn default() -> Self {
        Self {
            result: Ok(()),
            count: 0,
            iov: SmallVec::new(),
            rx_want: 0,
            rx_buf: None,
            msg: None,
            inputs: Default::default(),
            outputs: Default::default(),
            prov_data: None,
            timeout: Timeout::Infinite,
            expire_at: None,
            use_expire: false,
            sched_deadline: None,
            cancel: None,
            abort: None,
            stop_requested: false,
            expire_ok: false,
            sleep: false,
            expiring: false,
        }
    }
}

impl Aio {
    /// Allocate an AIO with its completion callback.
    ///
    /// The callback runs on a worker thread (or the completer's thread for
    /// synchronous finishes), exactly once per started operation. A new
    /// operation may be started from within the callback.
    pub fn new(cb: impl Fn(&Aio) + Send + Sync + 'static) -> Self {
        let cb = Arc::new(cb);
        let shard = crate::system::expire_queues().pick();
        let inner = Arc::new_cyclic(|weak: &Weak<AioInner>| {
            let weak = weak.clone();
            let task = Task::new(move || {
                if let Some(inner) = weak.upgrade() {
                    cb(&Aio { inner });
                }
            });
            AioInner {
                shard,
                task,
                st: Mutex::new(AioState::default()),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<AioInner>) -> Self {
        Self { inner }
    }

    /// Identity comparison across clones.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Clear per-operation state ahead of `start`.
    ///
    /// Providers call this immediately before starting an operation. It
    /// clears result, count, pending abort, `expire_ok`, sleep, and output
    /// slots; it does not touch the timeout, inputs, iov, or message.
    pub fn reset(&self) {
        let mut st = self.inner.st.lock();
        st.result = Ok(());
        st.count = 0;
        st.abort = None;
        st.expire_ok = false;
        st.sleep = false;
        for slot in &mut st.outputs {
            *slot = None;
        }
    }

    // --- deadline configuration -----------------------------------------

    /// Set the relative timeout, clearing any absolute deadline.
    pub fn set_timeout(&self, timeout: Timeout) {
        let mut st = self.inner.st.lock();
        st.timeout = timeout;
        st.use_expire = false;
    }

    #[must_use]
    pub fn timeout(&self) -> Timeout {
        self.inner.st.lock().timeout
    }

    /// Set an absolute deadline, overriding the relative timeout.
    pub fn set_expire(&self, deadline: Instant) {
        let mut st = self.inner.st.lock();
        st.expire_at = Some(deadline);
        st.use_expire = true;
    }

    /// Replace a `Timeout::Default` timeout with the provider's default.
    pub fn normalize_timeout(&self, default: Timeout) {
        let mut st = self.inner.st.lock();
        if st.timeout == Timeout::Default {
            st.timeout = default;
        }
    }

    // --- scheduling ------------------------------------------------------

    /// Begin an operation, installing its cancel hook.
    ///
    /// Returns `true` if the operation is now owned by the provider, which
    /// must complete it with exactly one `finish` call. Returns `false`
    /// when the AIO refuses the operation (stopped, aborted, or already
    /// past its deadline); in that case the terminal completion has been
    /// dispatched here and the provider must simply discard the request.
    #[must_use = "a false return means the provider does not own the operation"]
    pub fn start(&self, cancel: impl FnOnce(&Aio, Error) + Send + 'static) -> bool {
        let inner = &self.inner;
        let now = Instant::now();
        let mut past_deadline = false;

        {
            // Resolve the deadline. Only the submitting thread touches
            // these fields between reset and start.
            let mut st = inner.st.lock();
            if !st.sleep && !st.use_expire {
                st.sched_deadline = match st.timeout {
                    Timeout::Zero => {
                        past_deadline = true;
                        None
                    }
                    Timeout::Infinite | Timeout::Default => None,
                    Timeout::After(d) => now.checked_add(d),
                };
            } else if st.use_expire {
                match st.expire_at {
                    Some(at) if at <= now => past_deadline = true,
                    at => st.sched_deadline = at,
                }
            }
            // Sleeps pre-compute their deadline and may expire successfully.
            if !st.sleep {
                st.expire_ok = false;
            }
            st.result = Ok(());
        }

        // Prep outside the locks; the failure paths below dispatch a task
        // that was prepped here.
        inner.task.prep();

        let shard = inner.shard.clone();
        let mut sh = shard.st.lock();
        let mut st = inner.st.lock();

        if st.stop_requested || sh.stopping {
            st.stop_requested = true;
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            st.result = Err(Error::Stopped);
            drop(st);
            drop(sh);
            inner.task.dispatch();
            return false;
        }
        if let Some(code) = st.abort.take() {
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            st.result = Err(code);
            drop(st);
            drop(sh);
            inner.task.dispatch();
            return false;
        }
        if past_deadline {
            st.result = if st.expire_ok { Ok(()) } else { Err(Error::TimedOut) };
            st.sleep = false;
            st.expire_ok = false;
            st.count = 0;
            drop(st);
            drop(sh);
            inner.task.dispatch();
            return false;
        }

        debug_assert!(st.cancel.is_none());
        st.cancel = Some(Box::new(cancel));

        if let Some(deadline) = st.sched_deadline {
            sh.entries.push((deadline, inner.clone()));
            if sh.next.map_or(true, |n| deadline < n) {
                sh.next = Some(deadline);
                shard.cv.notify_all();
            }
        }
        true
    }

    fn finish_impl(&self, result: Result<()>, count: usize, msg: Option<Msg>, sync: bool) {
        let inner = &self.inner;
        // Providers may finish an aio they never started (refused
        // operations); make sure waiters observe the completion.
        inner.task.prep();
        {
            let mut sh = inner.shard.st.lock();
            let mut st = inner.st.lock();
            ExpireShard::unlink(&mut sh, inner);
            st.cancel = None;
            st.result = result;
            st.count = count;
            if let Some(m) = msg {
                st.msg = Some(m);
            }
            st.sched_deadline = None;
            st.expire_at = None;
            st.use_expire = false;
            st.sleep = false;
        }
        if sync {
            inner.task.exec();
        } else {
            inner.task.dispatch();
        }
    }

    /// Complete the operation. Must be called exactly once per started
    /// operation, by the provider.
    pub fn finish(&self, result: Result<()>, count: usize) {
        self.finish_impl(result, count, None, false);
    }

    /// Complete on the caller's thread. Used when draining a completion
    /// list from a known-safe context to reduce latency.
    pub fn finish_sync(&self, result: Result<()>, count: usize) {
        self.finish_impl(result, count, None, true);
    }

    pub fn finish_error(&self, err: Error) {
        self.finish_impl(Err(err), 0, None, false);
    }

    /// Complete a receive, transferring message ownership to the AIO.
    pub fn finish_msg(&self, msg: Msg) {
        let n = msg.len();
        self.finish_impl(Ok(()), n, Some(msg), false);
    }

    pub fn finish_msg_sync(&self, msg: Msg) {
        let n = msg.len();
        self.finish_impl(Ok(()), n, Some(msg), true);
    }

    /// Cancel the outstanding operation with `code`.
    ///
    /// If the provider has installed a cancel hook, it is invoked (outside
    /// the locks) and is responsible for completing the AIO. If no hook is
    /// installed yet, the abort is recorded so the next `start` fails with
    /// `code`.
    pub fn abort(&self, code: Error) {
        let inner = &self.inner;
        let hook = {
            let mut sh = inner.shard.st.lock();
            let mut st = inner.st.lock();
            ExpireShard::unlink(&mut sh, inner);
            let hook = st.cancel.take();
            if hook.is_none() {
                st.abort = Some(code.clone());
                st.result = Err(code.clone());
            }
            hook
        };
        if let Some(f) = hook {
            f(self, code);
        }
    }

    /// Alias for `abort(Error::Canceled)`.
    pub fn cancel(&self) {
        self.abort(Error::Canceled);
    }

    /// Cancel and refuse all further starts, without waiting.
    pub fn close(&self) {
        let inner = &self.inner;
        let hook = {
            let mut sh = inner.shard.st.lock();
            let mut st = inner.st.lock();
            ExpireShard::unlink(&mut sh, inner);
            st.stop_requested = true;
            st.cancel.take()
        };
        if let Some(f) = hook {
            f(self, Error::Stopped);
        }
    }

    /// Like `close`, then block until the current callback completes.
    ///
    /// Subsequent starts fail with `Stopped`. Waits out any in-progress
    /// expiration so the cancel hook cannot fire twice.
    pub fn stop(&self) {
        let inner = &self.inner;
        let hook = {
            let mut sh = inner.shard.st.lock();
            inner.st.lock().stop_requested = true;
            while inner.st.lock().expiring {
                inner.shard.cv.wait(&mut sh);
            }
            let mut st = inner.st.lock();
            ExpireShard::unlink(&mut sh, inner);
            st.cancel.take()
        };
        if let Some(f) = hook {
            f(self, Error::Stopped);
        }
        self.wait();
    }

    /// Block until the current callback has completed. Does not prevent
    /// re-use.
    pub fn wait(&self) {
        self.inner.task.wait();
    }

    /// Non-blocking probe of the task busy flag.
    #[must_use]
    pub fn busy(&self) -> bool {
        self.inner.task.busy()
    }

    // --- results ---------------------------------------------------------

    /// Result of the last completed operation.
    pub fn result(&self) -> Result<()> {
        self.inner.st.lock().result.clone()
    }

    /// Bytes transferred by the last operation.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.st.lock().count
    }

    pub fn bump_count(&self, n: usize) {
        self.inner.st.lock().count += n;
    }

    // --- transmit vector -------------------------------------------------

    /// Install transmit segments, up to [`MAX_IOV`].
    pub fn set_iov(&self, segs: &[Bytes]) -> Result<()> {
        if segs.len() > MAX_IOV {
            return Err(Error::Inval);
        }
        let mut st = self.inner.st.lock();
        st.iov = segs.iter().cloned().collect();
        Ok(())
    }

    /// Snapshot of the transmit segments (cheap refcounted clones).
    #[must_use]
    pub fn iov(&self) -> SmallVec<[Bytes; MAX_IOV]> {
        self.inner.st.lock().iov.clone()
    }

    /// Residual bytes across all transmit segments.
    #[must_use]
    pub fn iov_count(&self) -> usize {
        self.inner.st.lock().iov.iter().map(Bytes::len).sum()
    }

    /// Drop `n` bytes off the front of the transmit vector, collapsing
    /// empty segments. Returns the portion of `n` that could not be
    /// consumed.
    pub fn iov_advance(&self, mut n: usize) -> usize {
        let mut st = self.inner.st.lock();
        while n > 0 {
            let Some(front) = st.iov.first_mut() else {
                break;
            };
            if front.len() > n {
                front.advance(n);
                return 0;
            }
            n -= front.len();
            st.iov.remove(0);
        }
        n
    }

    // --- receive window --------------------------------------------------

    /// Arm a receive for up to `want` bytes.
    pub fn set_recv(&self, want: usize) {
        let mut st = self.inner.st.lock();
        st.rx_want = want;
        st.rx_buf = Some(BytesMut::with_capacity(want));
    }

    /// Bytes still needed to fill the receive window.
    #[must_use]
    pub fn recv_remaining(&self) -> usize {
        let st = self.inner.st.lock();
        let filled = st.rx_buf.as_ref().map_or(0, BytesMut::len);
        st.rx_want.saturating_sub(filled)
    }

    /// Append received bytes (provider side).
    pub fn recv_append(&self, data: &[u8]) {
        let mut st = self.inner.st.lock();
        if let Some(buf) = st.rx_buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Take the filled receive buffer, disarming the window.
    pub fn take_recv(&self) -> Option<BytesMut> {
        let mut st = self.inner.st.lock();
        st.rx_want = 0;
        st.rx_buf.take()
    }

    // --- message ownership -----------------------------------------------

    pub fn set_msg(&self, msg: Msg) {
        self.inner.st.lock().msg = Some(msg);
    }

    pub fn take_msg(&self) -> Option<Msg> {
        self.inner.st.lock().msg.take()
    }

    // --- opaque slots ----------------------------------------------------

    pub fn set_input(&self, index: usize, value: Box<dyn Any + Send>) {
        let mut st = self.inner.st.lock();
        if index < IO_SLOTS {
            st.inputs[index] = Some(value);
        }
    }

    pub fn take_input(&self, index: usize) -> Option<Box<dyn Any + Send>> {
        let mut st = self.inner.st.lock();
        st.inputs.get_mut(index).and_then(Option::take)
    }

    pub fn set_output(&self, index: usize, value: Box<dyn Any + Send>) {
        let mut st = self.inner.st.lock();
        if index < IO_SLOTS {
            st.outputs[index] = Some(value);
        }
    }

    pub fn take_output(&self, index: usize) -> Option<Box<dyn Any + Send>> {
        let mut st = self.inner.st.lock();
        st.outputs.get_mut(index).and_then(Option::take)
    }

    /// Typed take of an output slot.
    pub fn take_output_as<T: 'static>(&self, index: usize) -> Option<T> {
        self.take_output(index)
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn set_prov_data(&self, value: Box<dyn Any + Send>) {
        self.inner.st.lock().prov_data = Some(value);
    }

    pub fn take_prov_data(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.st.lock().prov_data.take()
    }
}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aio")
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

/// Schedule a pure timer on `aio`: the callback fires after `dur` with a
/// success result, or earlier with `TimedOut` when the AIO's own timeout is
/// shorter. Abort and close complete it with their code as usual.
pub fn sleep_aio(dur: Duration, aio: &Aio) {
    aio.reset();
    {
        let mut st = aio.inner.st.lock();
        st.expire_ok = true;
        st.sleep = true;
        let mut effective = dur;
        match st.timeout {
            Timeout::Default | Timeout::Infinite => {}
            Timeout::Zero => {
                st.expire_ok = false;
                effective = Duration::ZERO;
            }
            Timeout::After(t) => {
                // A shorter aio timeout still wakes us early, but reports
                // TimedOut rather than success.
                if dur > t {
                    st.expire_ok = false;
                    effective = t;
                }
            }
        }
        st.sched_deadline = Instant::now().checked_add(effective);
    }

    let started = aio.start(|a, code| {
        let unslept = {
            let mut sh = a.inner.shard.st.lock();
            let mut st = a.inner.st.lock();
            if st.sleep {
                st.sleep = false;
                ExpireShard::unlink(&mut sh, &a.inner);
                true
            } else {
                false
            }
        };
        if unslept {
            a.finish_error(code);
        }
    });
    // On refusal the terminal completion was already dispatched.
    let _ = started;
}

/// A list of deferred completions.
///
/// Transport callbacks that complete several AIOs under one lock collect
/// them here, drop the lock, then run the list; each entry finishes
/// synchronously on the caller's thread.
#[derive(Default)]
pub struct Completions {
    list: Vec<(Aio, Result<()>, usize)>,
}

impl Completions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, aio: Aio, result: Result<()>, count: usize) {
        self.list.push((aio, result, count));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Drain the list, finishing every entry synchronously.
    pub fn run(&mut self) {
        for (aio, result, count) in self.list.drain(..) {
            aio.finish_sync(result, count);
        }
    }
}

impl Drop for Completions {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_aio() -> (Aio, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (aio, hits)
    }

    #[test]
    fn test_start_and_finish_once() {
        let (aio, hits) = counting_aio();
        aio.reset();
        assert!(aio.start(|_, _| {}));
        aio.finish(Ok(()), 7);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.count(), 7);
        assert_eq!(aio.result(), Ok(()));
    }

    #[test]
    fn test_zero_timeout_fails_start() {
        let (aio, hits) = counting_aio();
        aio.set_timeout(Timeout::Zero);
        aio.reset();
        assert!(!aio.start(|_, _| {}));
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Err(Error::TimedOut));
    }

    #[test]
    fn test_stop_refuses_start() {
        let (aio, hits) = counting_aio();
        aio.stop();
        aio.reset();
        assert!(!aio.start(|_, _| {}));
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Err(Error::Stopped));
    }

    #[test]
    fn test_abort_invokes_cancel_hook() {
        let (aio, _) = counting_aio();
        aio.reset();
        assert!(aio.start(|a, code| a.finish_error(code)));
        aio.abort(Error::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Canceled));
    }

    #[test]
    fn test_abort_before_start_poisons_next_start() {
        let (aio, _) = counting_aio();
        aio.reset();
        aio.abort(Error::Canceled);
        assert!(!aio.start(|_, _| {}));
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Canceled));
    }

    #[test]
    fn test_normalize_timeout() {
        let (aio, _) = counting_aio();
        aio.set_timeout(Timeout::Default);
        aio.normalize_timeout(Timeout::After(Duration::from_secs(3)));
        assert_eq!(aio.timeout(), Timeout::After(Duration::from_secs(3)));

        aio.set_timeout(Timeout::Infinite);
        aio.normalize_timeout(Timeout::After(Duration::from_secs(3)));
        assert_eq!(aio.timeout(), Timeout::Infinite);
    }

    #[test]
    fn test_iov_advance() {
        let (aio, _) = counting_aio();
        aio.set_iov(&[Bytes::from_static(b"abc"), Bytes::from_static(b"defg")])
            .unwrap();
        assert_eq!(aio.iov_count(), 7);

        assert_eq!(aio.iov_advance(4), 0);
        assert_eq!(aio.iov_count(), 3);
        let segs = aio.iov();
        assert_eq!(segs.len(), 1);
        assert_eq!(&segs[0][..], b"efg");

        // Advancing past the end reports the unconsumed remainder.
        assert_eq!(aio.iov_advance(5), 2);
        assert_eq!(aio.iov_count(), 0);
    }

    #[test]
    fn test_iov_limit() {
        let (aio, _) = counting_aio();
        let segs: Vec<Bytes> = (0..9).map(|_| Bytes::from_static(b"x")).collect();
        assert_eq!(aio.set_iov(&segs), Err(Error::Inval));
    }

    #[test]
    fn test_recv_window() {
        let (aio, _) = counting_aio();
        aio.set_recv(8);
        assert_eq!(aio.recv_remaining(), 8);
        aio.recv_append(b"abcd");
        assert_eq!(aio.recv_remaining(), 4);
        aio.recv_append(b"efgh");
        assert_eq!(aio.recv_remaining(), 0);
        let buf = aio.take_recv().unwrap();
        assert_eq!(&buf[..], b"abcdefgh");
        assert_eq!(aio.recv_remaining(), 0);
    }

    #[test]
    fn test_msg_ownership() {
        let (aio, _) = counting_aio();
        aio.set_msg(Msg::from_bytes(b"m"));
        let msg = aio.take_msg().unwrap();
        assert_eq!(msg.body(), b"m");
        assert!(aio.take_msg().is_none());
    }

    #[test]
    fn test_output_slots() {
        let (aio, _) = counting_aio();
        aio.set_output(0, Box::new(41u32));
        assert_eq!(aio.take_output_as::<u32>(0), Some(41));
        assert!(aio.take_output(0).is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (aio, hits) = counting_aio();
        aio.reset();
        assert!(aio.start(|a, code| a.finish_error(code)));
        aio.close();
        aio.close();
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Err(Error::Stopped));
    }

    #[test]
    fn test_completions_run_all() {
        let (a1, h1) = counting_aio();
        let (a2, h2) = counting_aio();
        a1.reset();
        a2.reset();
        assert!(a1.start(|_, _| {}));
        assert!(a2.start(|_, _| {}));

        let mut cl = Completions::new();
        cl.add(a1.clone(), Ok(()), 3);
        cl.add(a2.clone(), Err(Error::ConnShut), 0);
        cl.run();

        assert_eq!(h1.load(Ordering::SeqCst), 1);
        assert_eq!(h2.load(Ordering::SeqCst), 1);
        assert_eq!(a1.count(), 3);
        assert_eq!(a2.result(), Err(Error::ConnShut));
    }
}
