use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::Deadline;
use crate::error::{BenchError, TransportError};
use crate::transport::{Completion, CompletionKind, Context, PeerAddr};

enum Lookup {
    Pending,
    Resolved(PeerAddr),
    Failed(TransportError),
}

struct LookupSlot {
    state: Mutex<Lookup>,
    done: Condvar,
}

impl LookupSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(Lookup::Pending),
            done: Condvar::new(),
        }
    }

    fn fill(&self, outcome: Result<Completion, TransportError>) {
        let mut state = self.lock();
        *state = match outcome {
            Ok(Completion::Lookup(peer)) => Lookup::Resolved(peer),
            Ok(other) => Lookup::Failed(TransportError::UnexpectedCompletion {
                expected: CompletionKind::Lookup,
                got: other.kind(),
            }),
            Err(e) => Lookup::Failed(e),
        };
        drop(state);
        self.done.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Lookup> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const RECHECK: Duration = Duration::from_millis(50);

/// Resolve `addr` through `ctx` and block until the lookup callback has run
/// on the progress thread. A failed lookup is always [`BenchError::Resolve`].
///
/// `stalled` is polled while waiting; once it holds, the progress thread is
/// gone and the lookup can never finish.
pub fn resolve<C, S>(
    ctx: &C,
    instance: usize,
    addr: &str,
    patience: Duration,
    deadline: Deadline,
    stalled: S,
) -> Result<PeerAddr, BenchError>
where
    C: Context,
    S: Fn() -> bool,
{
    let slot = Arc::new(LookupSlot::new());
    let writer = slot.clone();

    ctx.resolve_address(addr, patience, Box::new(move |outcome| writer.fill(outcome)))
        .map_err(|source| BenchError::Resolve {
            instance,
            addr: addr.to_string(),
            source,
        })?;

    let mut state = slot.lock();
    loop {
        match std::mem::replace(&mut *state, Lookup::Pending) {
            Lookup::Resolved(peer) => return Ok(peer),
            Lookup::Failed(source) => {
                return Err(BenchError::Resolve {
                    instance,
                    addr: addr.to_string(),
                    source,
                });
            }
            Lookup::Pending => {}
        }

        if stalled() {
            return Err(BenchError::EngineStopped { instance });
        }
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(BenchError::Timeout {
                instance,
                what: "address lookup",
                count: 0,
                threshold: 1,
            });
        }
        let (guard, _) = slot
            .done
            .wait_timeout(state, remaining.min(RECHECK))
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }
}
