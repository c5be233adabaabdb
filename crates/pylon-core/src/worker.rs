//! Bounded worker pool for service handlers.
//!
//! A fixed number of worker tasks drain a bounded queue. When the queue is
//! full the submitting task runs the job itself, so nothing is dropped and
//! the reader that submitted it stops pulling frames until it finishes.

use crate::{Result, RpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Unit of work run by the pool.
pub type Job = BoxFuture<'static, ()>;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Fixed-size pool with caller-runs saturation.
pub struct WorkerPool {
    name: String,
    capacity: usize,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks on the current Tokio runtime.
    pub fn new(name: impl Into<String>, workers: usize, capacity: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|index| tokio::spawn(worker_loop(format!("{}-{}", name, index), rx.clone())))
            .collect();

        Self {
            name,
            capacity: capacity.max(1),
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job`, or run it on the calling task if the queue is full.
    ///
    /// Fails with [`RpcError::Stopped`] after [`shutdown`](Self::shutdown).
    pub async fn execute(&self, job: Job) -> Result<()> {
        let sender = self.queue.lock().clone();
        let Some(sender) = sender else {
            return Err(RpcError::Stopped);
        };

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                debug!(pool = %self.name, "Worker queue full, running job on caller");
                run_guarded(&self.name, job).await;
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(RpcError::Stopped),
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        match &*self.queue.lock() {
            Some(sender) => self.capacity - sender.capacity(),
            None => 0,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Stop accepting jobs, let workers drain the queue for up to `grace`,
    /// then abort whatever is still running.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.queue.lock().take());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(pool = %self.name, ?grace, "Workers did not finish in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        } else {
            debug!(pool = %self.name, "Worker pool drained");
        }
    }
}

async fn worker_loop(worker: String, rx: SharedReceiver) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match job {
            Some(job) => run_guarded(&worker, job).await,
            None => break,
        }
    }
    debug!(worker = %worker, "Worker exiting");
}

async fn run_guarded(worker: &str, job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!(worker = %worker, "Job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_run_on_workers() {
        let pool = WorkerPool::new("test", 2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(8);

        for _ in 0..5 {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            pool.execute(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send(()).await;
                }
                .boxed(),
            )
            .await
            .unwrap();
        }

        for _ in 0..5 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_full_queue_runs_on_caller() {
        let pool = WorkerPool::new("test", 1, 1);

        // Occupy the only worker.
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.execute(
            async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            }
            .boxed(),
        )
        .await
        .unwrap();
        started_rx.await.unwrap();

        // Fill the queue.
        pool.execute(async {}.boxed()).await.unwrap();
        assert_eq!(pool.queued(), 1);

        // The next job has nowhere to go and runs inline.
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        pool.execute(
            async move {
                ran_clone.store(true, Ordering::SeqCst);
            }
            .boxed(),
        )
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));

        let _ = release_tx.send(());
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1, 4);
        pool.execute(async { panic!("handler blew up") }.boxed())
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        pool.execute(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        )
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs_and_aborts_stragglers() {
        let pool = WorkerPool::new("test", 1, 4);
        pool.execute(tokio::time::sleep(Duration::from_secs(3600)).boxed())
            .await
            .unwrap();

        let started = std::time::Instant::now();
        pool.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(pool.is_shut_down());

        assert!(matches!(
            pool.execute(async {}.boxed()).await,
            Err(RpcError::Stopped)
        ));
    }
}
