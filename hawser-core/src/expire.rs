//! Sharded expiration queues.
//!
//! Each AIO is assigned one shard at construction. A shard owns a
//! deadline-keyed list of scheduled AIOs and a thread that walks the list,
//! cancelling everything past its deadline. Multiple shards (by default one
//! per CPU) spread the lock pressure of busy timeout workloads.
//!
//! The shard thread pins an AIO (`expiring`) before invoking its cancel
//! hook so teardown paths can wait for the hook to return; the hook itself
//! always runs with the shard lock released.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::aio::{Aio, AioInner};
use crate::error::Error;

/// Upper bound on AIOs cancelled per wakeup pass.
const EXPIRE_BATCH: usize = 64;

pub struct ExpireShard {
    pub(crate) st: Mutex<ShardState>,
    pub(crate) cv: Condvar,
}

pub(crate) struct ShardState {
    pub(crate) entries: Vec<(Instant, Arc<AioInner>)>,
    /// Earliest scheduled deadline; `None` means nothing scheduled.
    pub(crate) next: Option<Instant>,
    pub(crate) stopping: bool,
    exit: bool,
}

impl ExpireShard {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            st: Mutex::new(ShardState {
                entries: Vec::new(),
                next: None,
                stopping: false,
                exit: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Remove `aio` from the scheduled list, if present.
    ///
    /// The wake deadline is deliberately left alone; at worst the thread
    /// takes one spurious wakeup, which it tolerates anyway.
    pub(crate) fn unlink(sh: &mut ShardState, aio: &Arc<AioInner>) {
        if let Some(pos) = sh
            .entries
            .iter()
            .position(|(_, a)| Arc::ptr_eq(a, aio))
        {
            sh.entries.swap_remove(pos);
        }
    }

    fn run(self: &Arc<Self>) {
        let mut sh = self.st.lock();
        loop {
            let now = Instant::now();

            if sh.entries.is_empty() && sh.exit {
                return;
            }

            let due = sh.next.is_some_and(|t| now >= t);
            let force = sh.stopping && !sh.entries.is_empty();
            if !due && !force {
                match sh.next {
                    Some(t) => {
                        self.cv.wait_until(&mut sh, t);
                    }
                    None => self.cv.wait(&mut sh),
                }
                continue;
            }

            // One pass over the list: unlink and pin everything due (or
            // everything, when stopping), tracking the earliest survivor.
            sh.next = None;
            let stopping = sh.stopping;
            let mut batch: Vec<Arc<AioInner>> = Vec::new();
            let mut i = 0;
            while i < sh.entries.len() {
                let (deadline, _) = sh.entries[i];
                if (stopping || deadline <= now) && batch.len() < EXPIRE_BATCH {
                    let (_, aio) = sh.entries.swap_remove(i);
                    aio.st.lock().expiring = true;
                    batch.push(aio);
                } else {
                    if sh.next.map_or(true, |n| deadline < n) {
                        sh.next = Some(deadline);
                    }
                    i += 1;
                }
            }
            drop(sh);

            for aio in batch {
                enum Action {
                    Dispatch,
                    Cancel(crate::aio::CancelFn, Error),
                    None,
                }
                let action = {
                    let mut st = aio.st.lock();
                    let result: crate::error::Result<()> = if stopping {
                        st.stop_requested = true;
                        Err(Error::Stopped)
                    } else if st.expire_ok {
                        st.expire_ok = false;
                        Ok(())
                    } else {
                        Err(Error::TimedOut)
                    };
                    let cancel = st.cancel.take();
                    if st.sleep {
                        // Plain timers complete right here; no provider to
                        // unwind.
                        st.result = result;
                        st.count = 0;
                        st.sleep = false;
                        Action::Dispatch
                    } else if let Some(f) = cancel {
                        let code = result.err().unwrap_or(Error::TimedOut);
                        Action::Cancel(f, code)
                    } else {
                        Action::None
                    }
                };
                match action {
                    Action::Dispatch => aio.task.dispatch(),
                    // The hook completes the aio; no lock may be held here.
                    Action::Cancel(f, code) => f(&Aio::from_inner(aio.clone()), code),
                    Action::None => {}
                }

                // Unpin under the shard lock so waiters in stop/fini cannot
                // miss the wakeup.
                let sh2 = self.st.lock();
                aio.st.lock().expiring = false;
                drop(sh2);
                self.cv.notify_all();
            }

            sh = self.st.lock();
        }
    }

    /// Stop accepting deadlines and cancel everything scheduled, waiting
    /// for the list to drain. Returns true if there was anything to drain.
    fn stop_drain(&self) -> bool {
        let mut waited = false;
        let mut sh = self.st.lock();
        sh.stopping = true;
        self.cv.notify_all();
        while !sh.entries.is_empty() {
            waited = true;
            self.cv.wait(&mut sh);
        }
        waited
    }

    fn request_exit(&self) {
        let mut sh = self.st.lock();
        sh.exit = true;
        self.cv.notify_all();
    }
}

/// The process-wide shard array.
pub(crate) struct ExpireQueues {
    shards: Vec<Arc<ExpireShard>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ExpireQueues {
    pub(crate) fn new(count: usize) -> Self {
        let mut shards = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for i in 0..count.max(1) {
            let shard = ExpireShard::new();
            let t = shard.clone();
            let handle = thread::Builder::new()
                .name(format!("hawser:expire:{i}"))
                .spawn(move || t.run())
                .expect("spawn expire thread");
            shards.push(shard);
            threads.push(handle);
        }
        Self {
            shards,
            threads: Mutex::new(threads),
        }
    }

    /// Random shard assignment for a new AIO.
    pub(crate) fn pick(&self) -> Arc<ExpireShard> {
        let idx = rand::thread_rng().gen_range(0..self.shards.len());
        self.shards[idx].clone()
    }

    /// Drain every shard; true if any had scheduled work.
    pub(crate) fn drain(&self) -> bool {
        let mut any = false;
        for shard in &self.shards {
            if shard.stop_drain() {
                any = true;
            }
        }
        any
    }

    /// Drain, then terminate and join the shard threads.
    pub(crate) fn fini(&self) {
        self.drain();
        for shard in &self.shards {
            shard.request_exit();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::{sleep_aio, Aio, Timeout};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_sleep_fires_with_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        sleep_aio(Duration::from_millis(30), &aio);
        aio.wait();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.result(), Ok(()));
    }

    #[test]
    fn test_short_timeout_preempts_sleep() {
        let aio = Aio::new(|_| {});
        aio.set_timeout(Timeout::After(Duration::from_millis(20)));
        let start = Instant::now();
        sleep_aio(Duration::from_secs(10), &aio);
        aio.wait();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(aio.result(), Err(crate::error::Error::TimedOut));
        assert_eq!(aio.count(), 0);
    }

    #[test]
    fn test_abort_cancels_sleep() {
        let aio = Aio::new(|_| {});
        sleep_aio(Duration::from_secs(30), &aio);
        aio.abort(Error::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Canceled));
    }

    #[test]
    fn test_many_timers_across_shards() {
        let mut aios = Vec::new();
        for _ in 0..100 {
            let aio = Aio::new(|_| {});
            sleep_aio(Duration::from_millis(10), &aio);
            aios.push(aio);
        }
        for aio in &aios {
            aio.wait();
            assert_eq!(aio.result(), Ok(()));
        }
    }
}
