//! Process-wide system context.
//!
//! One expiration-shard array, one task pool, one reaper. Embedders may
//! size the shard array explicitly with [`init`]; otherwise the context
//! initializes lazily with defaults on first use.

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::expire::ExpireQueues;
use crate::reap::Reaper;
use crate::task::TaskPool;

/// Initialization parameters.
#[derive(Debug, Clone, Copy)]
pub struct InitParams {
    /// Expiration shard count; 0 means one per CPU.
    pub num_expire_threads: usize,
    /// Upper bound on expiration shards; 0 means the built-in cap.
    pub max_expire_threads: usize,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            num_expire_threads: 0,
            max_expire_threads: 8,
        }
    }
}

struct System {
    expire: ExpireQueues,
    tasks: TaskPool,
    reaper: Reaper,
}

impl System {
    fn new(params: InitParams) -> Self {
        let max = match params.max_expire_threads {
            0 => 8,
            m => m.min(256),
        };
        let num = match params.num_expire_threads {
            0 => num_cpus::get(),
            n => n,
        }
        .clamp(1, max);

        let workers = num_cpus::get().clamp(2, 16);

        Self {
            expire: ExpireQueues::new(num),
            tasks: TaskPool::new(workers),
            reaper: Reaper::new(),
        }
    }
}

static SYSTEM: OnceCell<System> = OnceCell::new();

/// Initialize the system context explicitly. Fails with `Busy` if the
/// context is already up (explicitly or lazily).
pub fn init(params: InitParams) -> Result<()> {
    let mut fresh = false;
    SYSTEM.get_or_init(|| {
        fresh = true;
        System::new(params)
    });
    if fresh {
        Ok(())
    } else {
        Err(Error::Busy)
    }
}

fn system() -> &'static System {
    SYSTEM.get_or_init(|| System::new(InitParams::default()))
}

pub(crate) fn expire_queues() -> &'static ExpireQueues {
    &system().expire
}

pub(crate) fn task_pool() -> &'static TaskPool {
    &system().tasks
}

pub(crate) fn reaper() -> &'static Reaper {
    &system().reaper
}

/// Cancel all scheduled deadlines and wait for the shards to drain.
/// Returns true if any shard had scheduled work.
pub fn drain() -> bool {
    expire_queues().drain()
}

/// Orderly shutdown: drain and join the expiration threads. After this,
/// new AIO starts fail with `Stopped`. Intended for process teardown;
/// cannot be undone.
pub fn fini() {
    if let Some(sys) = SYSTEM.get() {
        sys.expire.fini();
        sys.reaper.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_init_then_explicit_fails() {
        let _ = system();
        assert_eq!(init(InitParams::default()), Err(Error::Busy));
    }
}
