//! Deferred destruction.
//!
//! Reference-counted objects (pipes, TLS connections, WebSockets) must be
//! able to schedule their own teardown while arbitrary locks are held by
//! the caller. The reaper runs those finalizers on its own thread where no
//! locks are held.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

type Finalizer = Box<dyn FnOnce() + Send>;

pub(crate) struct Reaper {
    tx: flume::Sender<Finalizer>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl Reaper {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded::<Finalizer>();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let p = pending.clone();
        thread::Builder::new()
            .name("hawser:reap".to_string())
            .spawn(move || {
                while let Ok(f) = rx.recv() {
                    f();
                    let (lock, cv) = &*p;
                    let mut n = lock.lock();
                    *n -= 1;
                    cv.notify_all();
                }
            })
            .expect("spawn reaper");
        Self { tx, pending }
    }

    pub(crate) fn schedule(&self, f: Finalizer) {
        {
            let (lock, _) = &*self.pending;
            *lock.lock() += 1;
        }
        if self.tx.send(f).is_err() {
            // Reaper gone (fini); undo the count. The finalizer is dropped,
            // which still releases whatever it owned.
            let (lock, cv) = &*self.pending;
            *lock.lock() -= 1;
            cv.notify_all();
        }
    }

    /// Block until every scheduled finalizer has run.
    pub(crate) fn wait_idle(&self) {
        let (lock, cv) = &*self.pending;
        let mut n = lock.lock();
        while *n != 0 {
            cv.wait(&mut n);
        }
    }
}

/// Schedule `f` to run on the reaper thread.
pub fn reap(f: impl FnOnce() + Send + 'static) {
    crate::system::reaper().schedule(Box::new(f));
}

/// Block until the reaper queue is empty. Test and shutdown aid.
pub fn reap_drain() {
    crate::system::reaper().wait_idle();
}
