use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Work executed by the pool's workers.
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + 'static;

    fn handle(&self, job: Self::Job) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool size must be positive")]
    ZeroSize,

    #[error("worker pool is closed")]
    Closed,
}

/// Outcome of one batch once its barrier has passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Envelope<J> {
    job: J,
    done: oneshot::Sender<bool>,
}

type SharedReceiver<J> = Arc<Mutex<mpsc::Receiver<Envelope<J>>>>;

/// Fixed set of workers draining a bounded queue.
///
/// At most `size` jobs run at once and at most `size` more wait in the
/// queue; submitting beyond that suspends the submitter.
pub struct WorkerPool<H: JobHandler> {
    tx: mpsc::Sender<Envelope<H::Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl<H: JobHandler> WorkerPool<H> {
    /// Spawns `size` workers sharing `handler`.
    pub fn new(size: usize, handler: H) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }

        let (tx, rx) = mpsc::channel(size);
        let rx: SharedReceiver<H::Job> = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        let workers = (0..size)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&rx), Arc::clone(&handler))))
            .collect();

        Ok(Self { tx, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Starts a new batch of jobs sharing one completion barrier.
    pub fn batch(&self) -> Batch<'_, H::Job> {
        Batch {
            tx: &self.tx,
            pending: Vec::new(),
        }
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub async fn release(self) {
        let Self { tx, workers } = self;
        drop(tx);

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "pool worker exited abnormally");
            }
        }
    }
}

async fn worker_loop<H: JobHandler>(id: usize, rx: SharedReceiver<H::Job>, handler: Arc<H>) {
    loop {
        let next = { rx.lock().await.recv().await };

        let Some(Envelope { job, done }) = next else {
            debug!(worker = id, "pool worker stopping");
            return;
        };

        // A panicking job must not take the worker down with it.
        let handler = Arc::clone(&handler);
        let outcome = tokio::spawn(async move { handler.handle(job).await }).await;

        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(worker = id, error = %e, "job failed");
                false
            }
            Err(e) => {
                warn!(worker = id, error = %e, "job panicked");
                false
            }
        };

        // The batch may have been dropped without waiting.
        let _ = done.send(ok);
    }
}

/// Jobs submitted together and awaited together.
pub struct Batch<'a, J> {
    tx: &'a mpsc::Sender<Envelope<J>>,
    pending: Vec<oneshot::Receiver<bool>>,
}

impl<J: Send + 'static> Batch<'_, J> {
    /// Queues `job`, waiting for queue space if every slot is taken.
    pub async fn submit(&mut self, job: J) -> Result<(), PoolError> {
        let (done, rx) = oneshot::channel();

        self.tx
            .send(Envelope { job, done })
            .await
            .map_err(|_| PoolError::Closed)?;

        self.pending.push(rx);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Completion barrier: resolves once every submitted job has finished.
    pub async fn wait(self) -> BatchReport {
        let mut report = BatchReport {
            submitted: self.pending.len(),
            ..Default::default()
        };

        for rx in self.pending {
            match rx.await {
                Ok(true) => report.succeeded += 1,
                _ => report.failed += 1,
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    struct SlowHandler(Arc<Tracking>);

    impl JobHandler for SlowHandler {
        type Job = u32;

        async fn handle(&self, _job: u32) -> Result<()> {
            let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.0.active.fetch_sub(1, Ordering::SeqCst);
            self.0.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyHandler;

    impl JobHandler for FlakyHandler {
        type Job = u32;

        async fn handle(&self, job: u32) -> Result<()> {
            match job {
                2 => bail!("job {job} unreachable"),
                3 => panic!("job {job} exploded"),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = WorkerPool::new(0, FlakyHandler).err();
        assert_eq!(err, Some(PoolError::ZeroSize));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bounded_by_size() {
        let tracking = Arc::new(Tracking::default());
        let pool = WorkerPool::new(3, SlowHandler(Arc::clone(&tracking))).expect("pool");
        assert_eq!(pool.size(), 3);

        let mut batch = pool.batch();
        for job in 0..12 {
            batch.submit(job).await.expect("submit");
        }
        assert_eq!(batch.len(), 12);

        let report = batch.wait().await;

        assert_eq!(
            report,
            BatchReport {
                submitted: 12,
                succeeded: 12,
                failed: 0
            }
        );
        assert_eq!(tracking.done.load(Ordering::SeqCst), 12);
        assert!(tracking.peak.load(Ordering::SeqCst) <= 3);

        pool.release().await;
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let pool = WorkerPool::new(2, FlakyHandler).expect("pool");

        let mut batch = pool.batch();
        for job in 0..6 {
            batch.submit(job).await.expect("submit");
        }
        let report = batch.wait().await;
        assert_eq!(report.submitted, 6);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 2);

        // Workers survive the panic and keep serving later batches.
        let mut batch = pool.batch();
        for job in [0, 1, 4, 5] {
            batch.submit(job).await.expect("submit");
        }
        assert_eq!(batch.wait().await.succeeded, 4);

        pool.release().await;
    }

    #[tokio::test]
    async fn test_empty_batch_passes_barrier() {
        let pool = WorkerPool::new(1, FlakyHandler).expect("pool");
        let batch = pool.batch();
        assert!(batch.is_empty());
        assert_eq!(batch.wait().await, BatchReport::default());
        pool.release().await;
    }
}
