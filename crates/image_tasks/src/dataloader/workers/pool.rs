//! Worker pool for parallel data loading.
//!
//! Tasks are routed to specific workers over per-worker channels, so the
//! same batch always lands on the same worker and its random transforms are
//! reproducible.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::dataloader::common::thread::WORKER_ID;

/// Thread pool for parallel data loading.
///
/// - Task channels: Main thread -> one per worker (work distribution)
/// - Output channel: Workers -> Main thread (result collection)
/// - Shutdown flag: Enables graceful termination
pub(crate) struct WorkerPool<Task, Output> {
    workers: Vec<thread::JoinHandle<()>>,
    task_txs: Vec<Sender<Task>>,
    output_rx: Receiver<Output>,
    shutdown: Arc<AtomicBool>,
}

impl<Task, Output> WorkerPool<Task, Output>
where
    Task: Send + 'static,
    Output: Send + 'static,
{
    /// Spawns `num_workers` threads running `worker_fn`.
    ///
    /// Each worker's queue holds `buffer_size` tasks. The output channel
    /// holds `buffer_size * num_workers` results, so a worker never blocks
    /// on send as long as at most that many tasks are in flight.
    pub(crate) fn new<F>(num_workers: usize, buffer_size: usize, worker_fn: F) -> Result<Self>
    where
        F: Fn(Receiver<Task>, Sender<Output>, Arc<AtomicBool>) + Send + Sync + 'static,
    {
        if num_workers == 0 {
            bail!(
                "Cannot create WorkerPool with 0 workers. \
                Either set num_workers > 0 or use single-threaded mode."
            );
        }
        if buffer_size == 0 {
            bail!(
                "Cannot create WorkerPool with buffer_size 0. \
                Buffer size must be > 0 to prevent deadlocks."
            );
        }

        let mut task_txs = Vec::with_capacity(num_workers);
        let mut task_rxs = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = bounded(buffer_size);
            task_txs.push(tx);
            task_rxs.push(rx);
        }
        let (output_tx, output_rx) = bounded(buffer_size * num_workers);

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_fn = Arc::new(worker_fn);
        let mut workers = Vec::with_capacity(num_workers);

        for (worker_id, task_rx) in task_rxs.into_iter().enumerate() {
            let output_tx = output_tx.clone();
            let shutdown_clone = shutdown.clone();
            let worker_fn_clone = worker_fn.clone();

            let handle = thread::Builder::new()
                .name(format!("dataloader-worker-{}", worker_id))
                .spawn(move || {
                    WORKER_ID.with(|id| *id.borrow_mut() = worker_id);
                    worker_fn_clone(task_rx, output_tx, shutdown_clone);
                })
                .with_context(|| format!("Failed to spawn worker thread {}", worker_id))?;

            workers.push(handle);
        }
        tracing::debug!(num_workers, buffer_size, "Started worker pool");

        Ok(Self {
            workers,
            task_txs,
            output_rx,
            shutdown,
        })
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.task_txs.len()
    }

    /// Sends a task to one worker's queue.
    pub(crate) fn send(&self, worker: usize, task: Task) -> Result<()> {
        let tx = self
            .task_txs
            .get(worker)
            .with_context(|| format!("No worker {} in a pool of {}", worker, self.task_txs.len()))?;
        tx.send(task)
            .map_err(|_| anyhow!("Worker {} has stopped", worker))
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Output, RecvTimeoutError> {
        self.output_rx.recv_timeout(timeout)
    }
}

impl<Task, Output> Drop for WorkerPool<Task, Output> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Closing the task channels wakes idle workers.
        self.task_txs.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!("Stopped worker pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataloader::common::thread::current_worker_id;

    #[test]
    fn test_tasks_reach_the_chosen_worker() -> Result<()> {
        let pool: WorkerPool<usize, (usize, usize)> = WorkerPool::new(3, 2, |rx, tx, shutdown| {
            while !shutdown.load(Ordering::Relaxed) {
                match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(task) => {
                        if tx.send((task, current_worker_id())).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        assert_eq!(pool.num_workers(), 3);

        for task in 0..6 {
            pool.send(task % 3, task)?;
        }
        let mut results = (0..6)
            .map(|_| pool.recv_timeout(Duration::from_secs(5)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        results.sort();
        assert!(results.iter().all(|(task, worker)| task % 3 == *worker));
        assert!(pool.send(5, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_workers_rejected() {
        let pool = WorkerPool::<(), ()>::new(0, 1, |_, _, _| {});
        assert!(pool.is_err());
    }
}
