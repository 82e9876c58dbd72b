use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::{Callback, Completion};
use crate::error::TransportError;

pub type Ready = Box<dyn FnOnce() + Send>;

/// Finished operations waiting for `trigger`.
///
/// Producers are the transport's I/O tasks; the only consumer is the
/// progress thread, so callbacks never run concurrently.
#[derive(Default)]
pub struct CompletionQueue {
    ready: Mutex<VecDeque<Ready>>,
    wake: Notify,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ready: Ready) {
        self.lock().push_back(ready);
        self.wake.notify_one();
    }

    pub fn complete(&self, callback: Callback, outcome: Result<Completion, TransportError>) {
        self.push(Box::new(move || callback(outcome)));
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Run up to `max` queued callbacks. The lock is not held while a
    /// callback runs, so callbacks may queue more work.
    pub fn run(&self, max: usize) -> usize {
        let mut ran = 0;
        while ran < max {
            let next = self.lock().pop_front();
            match next {
                Some(ready) => {
                    ready();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Resolves once something has been pushed since the last wait.
    pub async fn wait(&self) {
        self.wake.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Ready>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
