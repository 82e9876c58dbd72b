use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

use super::counter::CompletionCounter;
use crate::config::Deadline;
use crate::error::BenchError;
use crate::transport::Context;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub triggered: u64,
    pub progress_calls: u64,
}

/// The per-instance network thread: trigger until idle, then progress,
/// until `stop` says otherwise. Callbacks only ever run here.
pub struct ProgressEngine {
    instance: usize,
    thread: JoinHandle<Result<EngineStats, BenchError>>,
}

impl ProgressEngine {
    /// If the loop fails, `counter` is faulted so the control thread wakes.
    pub fn start<C, S>(
        instance: usize,
        ctx: Arc<C>,
        stop: S,
        counter: Arc<CompletionCounter>,
        progress_timeout: Duration,
        deadline: Deadline,
    ) -> Result<Self, BenchError>
    where
        C: Context,
        S: Fn() -> bool + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name(format!("net-{}", instance))
            .spawn(move || {
                debug!("{}: network thread running", instance);
                let result = drive(instance, &*ctx, &stop, progress_timeout, deadline);
                match &result {
                    Ok(stats) => debug!(
                        "{}: network thread complete ({} callbacks, {} progress calls)",
                        instance, stats.triggered, stats.progress_calls
                    ),
                    Err(e) => {
                        error!("{}: network thread failed: {}", instance, e);
                        counter.fail(BenchError::EngineStopped { instance });
                    }
                }
                result
            })?;

        Ok(Self { instance, thread })
    }

    pub fn join(self) -> Result<EngineStats, BenchError> {
        self.thread.join().unwrap_or(Err(BenchError::Panicked {
            instance: self.instance,
            role: "network",
        }))
    }
}

fn drive<C, S>(
    instance: usize,
    ctx: &C,
    stop: &S,
    progress_timeout: Duration,
    deadline: Deadline,
) -> Result<EngineStats, BenchError>
where
    C: Context,
    S: Fn() -> bool,
{
    let mut stats = EngineStats::default();

    while !stop() {
        // each callback may flip the stop condition, so drain eagerly
        loop {
            let ran = ctx
                .trigger(1)
                .map_err(|source| BenchError::Progress { instance, source })?;
            if ran == 0 {
                break;
            }
            stats.triggered += ran as u64;
        }

        // recheck, since trigger can change it
        if !stop() {
            ctx.progress(progress_timeout)
                .map_err(|source| BenchError::Progress { instance, source })?;
            stats.progress_calls += 1;
        }

        if deadline.expired() && !stop() {
            return Err(BenchError::Timeout {
                instance,
                what: "network progress",
                count: stats.triggered,
                threshold: 0,
            });
        }
    }

    Ok(stats)
}
