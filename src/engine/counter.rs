use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::Deadline;
use crate::error::BenchError;

/// When `advance` wakes the waiting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    EveryAdvance,
    AtTarget,
}

#[derive(Debug, Default)]
struct Tally {
    count: u64,
    faulted: bool,
    fault: Option<BenchError>,
}

/// Mutex + condvar counter shared between the progress thread, which
/// advances it from callbacks, and the control thread, which waits on it.
#[derive(Debug)]
pub struct CompletionCounter {
    instance: usize,
    target: u64,
    wake: Wake,
    tally: Mutex<Tally>,
    cond: Condvar,
}

impl CompletionCounter {
    pub fn new(instance: usize, target: u64, wake: Wake) -> Self {
        Self {
            instance,
            target,
            wake,
            tally: Mutex::new(Tally::default()),
            cond: Condvar::new(),
        }
    }

    pub fn advance(&self) -> u64 {
        let mut tally = self.lock();
        tally.count += 1;
        let count = tally.count;
        if self.wake == Wake::EveryAdvance || count >= self.target {
            self.cond.notify_all();
        }
        count
    }

    /// Record a fatal failure. Only the first one is kept; waiters wake
    /// either way.
    pub fn fail(&self, err: BenchError) {
        let mut tally = self.lock();
        if !tally.faulted {
            tally.faulted = true;
            tally.fault = Some(err);
        }
        self.cond.notify_all();
    }

    pub fn count(&self) -> u64 {
        self.lock().count
    }

    pub fn reached(&self) -> bool {
        self.count() >= self.target
    }

    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }

    pub fn settled(&self) -> bool {
        let tally = self.lock();
        tally.faulted || tally.count >= self.target
    }

    pub fn await_at_least(
        &self,
        threshold: u64,
        deadline: Deadline,
        what: &'static str,
    ) -> Result<u64, BenchError> {
        let mut tally = self.lock();
        loop {
            if tally.count >= threshold {
                return Ok(tally.count);
            }
            if tally.faulted {
                return Err(tally
                    .fault
                    .take()
                    .unwrap_or(BenchError::EngineStopped {
                        instance: self.instance,
                    }));
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(BenchError::Timeout {
                    instance: self.instance,
                    what,
                    count: tally.count,
                    threshold,
                });
            }
            // spurious wakeups and timeouts both loop back to the checks
            let (guard, _) = self
                .cond
                .wait_timeout(tally, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            tally = guard;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
