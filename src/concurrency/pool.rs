//! Bounded parallel execution of independent work units.
//!
//! All scheduled work runs to completion before results are reported: a
//! single slow or failing unit must not hide results from its siblings.
//! Results come back indexed by input position, so callers merge in input
//! order regardless of completion order.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run-level cancellation signal. Cancelling stops new units from being
/// scheduled; units already past the gate finish (or time out) naturally, so
/// no write is left half-applied.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run up to `max_parallel` of the given futures concurrently, returning
/// each output at its input index. `None` means the unit was never scheduled
/// because the run was cancelled first.
pub async fn run_bounded<O, F>(tasks: Vec<F>, max_parallel: usize, cancel: CancelFlag) -> Vec<Option<O>>
where
    O: Send + 'static,
    F: Future<Output = O> + Send + 'static,
{
    let total = tasks.len();
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut set: JoinSet<(usize, Option<O>)> = JoinSet::new();

    for (index, task) in tasks.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, None);
            };
            // The permit is the scheduling gate: a cancel that lands before
            // this point keeps the unit from ever starting.
            if cancel.is_cancelled() {
                return (index, None);
            }
            (index, Some(task.await))
        });
    }

    let mut results: Vec<Option<O>> = std::iter::repeat_with(|| None).take(total).collect();
    while let Some(joined) = set.join_next().await {
        if let Ok((index, output)) = joined {
            results[index] = output;
        }
    }
    results
}
