//! Completion tasks and the worker pool that runs them.
//!
//! A task owns a callback plus a `busy` flag. Providers mark the task busy
//! when an operation starts (`prep`), and the pool runs the callback once
//! the operation completes (`dispatch`) or the completer runs it inline
//! (`exec`). `wait` blocks until the callback has returned.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// A schedulable callback with a busy flag.
///
/// Each AIO owns exactly one task, so completions of a single AIO are
/// naturally serialized. Callbacks may run on any worker thread; no
/// affinity is assumed.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    busy: Mutex<bool>,
    cv: Condvar,
    work: Box<dyn Fn() + Send + Sync>,
}

impl Task {
    pub fn new(work: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                busy: Mutex::new(false),
                cv: Condvar::new(),
                work: Box::new(work),
            }),
        }
    }

    /// Mark the task busy ahead of an operation start.
    pub fn prep(&self) {
        *self.inner.busy.lock() = true;
    }

    /// Queue the task for a worker thread.
    pub fn dispatch(&self) {
        crate::system::task_pool().dispatch(self.clone());
    }

    /// Run the callback on the caller's thread.
    pub fn exec(&self) {
        self.run();
    }

    pub(crate) fn run(&self) {
        (self.inner.work)();
        let mut busy = self.inner.busy.lock();
        *busy = false;
        self.inner.cv.notify_all();
    }

    /// Block until the callback has completed.
    ///
    /// Must not be called from within the callback itself.
    pub fn wait(&self) {
        let mut busy = self.inner.busy.lock();
        while *busy {
            self.inner.cv.wait(&mut busy);
        }
    }

    /// Non-blocking probe of the busy flag.
    #[must_use]
    pub fn busy(&self) -> bool {
        *self.inner.busy.lock()
    }
}

/// Process-wide bounded worker pool.
pub(crate) struct TaskPool {
    tx: flume::Sender<Task>,
}

impl TaskPool {
    pub(crate) fn new(workers: usize) -> Self {
        let (tx, rx) = flume::unbounded::<Task>();
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("hawser:task:{i}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task.run();
                    }
                })
                .expect("spawn task worker");
        }
        Self { tx }
    }

    pub(crate) fn dispatch(&self, task: Task) {
        // After fini the channel is gone; run inline so the completion is
        // never lost.
        if let Err(flume::SendError(task)) = self.tx.send(task) {
            task.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_prep_dispatch_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        task.prep();
        assert!(task.busy());
        task.dispatch();
        task.wait();
        assert!(!task.busy());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exec_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        task.prep();
        task.exec();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!task.busy());
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let task = Task::new(|| thread::sleep(Duration::from_millis(50)));
        task.prep();
        let start = std::time::Instant::now();
        task.dispatch();
        task.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
