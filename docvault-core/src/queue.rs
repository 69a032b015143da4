//! Per-document serial work queue.
//!
//! Jobs run one at a time in submission order on a background task. A job
//! that panics is logged and the queue carries on with the next one.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::{DocumentError, Result};

type Job = BoxFuture<'static, ()>;

pub struct SerialQueue {
    label: String,
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl SerialQueue {
    /// Start a queue worker on `runtime`.
    pub fn new(label: impl Into<String>, runtime: &Handle) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_label = label.clone();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    tracing::error!(queue = %worker_label, "queued job panicked");
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!(queue = %worker_label, "queue drained and closed");
        });

        Self { label, tx, pending }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Append a job. Ordering is fixed at the time of this call.
    pub fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job.boxed()).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DocumentError::QueueClosed);
        }
        Ok(())
    }

    /// Append a job and get a receiver for its output.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(async move {
            let _ = tx.send(job.await);
        })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = SerialQueue::new("test", &Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..10u64 {
            let log = log.clone();
            receivers.push(
                queue
                    .submit(async move {
                        // later jobs finish faster if they were allowed to overlap
                        tokio::time::sleep(Duration::from_millis(10 - i)).await;
                        log.lock().push(i);
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn jobs_never_overlap() {
        let queue = SerialQueue::new("test", &Handle::current());
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..8 {
            let active = active.clone();
            let overlapped = overlapped.clone();
            receivers.push(
                queue
                    .submit(async move {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_queue() {
        let queue = SerialQueue::new("test", &Handle::current());
        let failed = queue.submit(async { panic!("boom") }).unwrap();
        let next = queue.submit(async { 42 }).unwrap();

        assert!(failed.await.is_err());
        assert_eq!(next.await.unwrap(), 42);
    }
}
