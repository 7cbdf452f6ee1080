//! Bounded worker pool shared by the content registrar and the attachment
//! synchronizer.
//!
//! ```text
//!                 ┌──────────── queue (Mutex<VecDeque>) ────────────┐
//!                 │  job-1  job-2  job-3  job-4  job-5  ...         │
//!                 └────┬──────────────┬──────────────┬──────────────┘
//!                  worker 1       worker 2   ...  worker N
//!                      ▼
//!                 outcome channel (mpsc) ──► drained after every worker joined
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// `floor(available × machine_load)`, at least one, at most `max_workers`.
pub fn pool_size(available: usize, machine_load: f64, max_workers: usize) -> usize {
    let scaled = (available as f64 * machine_load).floor() as usize;
    scaled.max(1).min(max_workers.max(1))
}

/// Same as [`pool_size`] against the parallelism of this machine.
pub fn machine_pool_size(machine_load: f64, max_workers: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    pool_size(available, machine_load, max_workers)
}

/// Runs `work` over every keyed job on `workers` tasks and collects the
/// outcomes by key.
///
/// Returns after every worker has joined. A key missing from the result lost
/// its worker before reporting back; callers decide what that means.
pub async fn run_pool<J, O, F, Fut>(
    label: &'static str,
    jobs: Vec<(String, J)>,
    workers: usize,
    work: F,
) -> BTreeMap<String, O>
where
    J: Send + 'static,
    O: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let mut outcomes = BTreeMap::new();
    if jobs.is_empty() {
        return outcomes;
    }
    let workers = workers.max(1).min(jobs.len());

    let queue: Arc<Mutex<VecDeque<(String, J)>>> = Arc::new(Mutex::new(jobs.into()));
    let work = Arc::new(work);
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, O)>();

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let queue = Arc::clone(&queue);
        let work = Arc::clone(&work);
        let tx = tx.clone();
        pool.spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let Some((key, job)) = next else { break };
                let outcome = (*work)(job).await;
                if tx.send((key, outcome)).is_err() {
                    break;
                }
            }
            tracing::trace!(pool = label, worker, "worker drained");
        });
    }
    drop(tx);

    while let Some(joined) = pool.join_next().await {
        if let Err(err) = joined {
            tracing::error!(pool = label, error = %err, "worker aborted");
        }
    }
    while let Some((key, outcome)) = rx.recv().await {
        outcomes.insert(key, outcome);
    }
    outcomes
}
