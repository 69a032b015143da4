//! Watchdog for operations that may hang.
//!
//! The detector runs an operation, hands it a [`Completion`] signal and
//! alerts its delegate once if the signal has not arrived in time. Alerting
//! never interrupts the operation: the detector stays alive until the
//! completion signal fires or is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Receiver of time-limit alerts.
pub trait DeadlockDelegate<C>: Send + Sync {
    fn deadlock_detector_did_exceed_time_limit(&self, detector: &DeadlockDetector<C>);
}

pub struct DeadlockDetector<C> {
    context: C,
    started_at: Instant,
    max_duration: Duration,
    exceeded: AtomicBool,
    completed: AtomicBool,
}

/// Completion signal handed to a guarded operation. Dropping it counts as
/// completion.
pub struct Completion {
    tx: Option<oneshot::Sender<()>>,
}

impl Completion {
    pub fn complete(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.signal();
    }
}

impl<C> DeadlockDetector<C>
where
    C: Send + Sync + 'static,
{
    /// Run `body` with a time limit of `max_duration`.
    ///
    /// Must be called from within a tokio runtime. The returned handle can
    /// be inspected but does not need to be kept; the watchdog task holds
    /// its own reference until completion.
    pub fn perform<F>(
        context: C,
        max_duration: Duration,
        delegate: Weak<dyn DeadlockDelegate<C>>,
        body: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Completion),
    {
        let detector = Arc::new(Self {
            context,
            started_at: Instant::now(),
            max_duration,
            exceeded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        });
        let (tx, mut rx) = oneshot::channel::<()>();

        let watcher = detector.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(max_duration, &mut rx).await.is_err() {
                watcher.exceeded.store(true, Ordering::SeqCst);
                if let Some(delegate) = delegate.upgrade() {
                    delegate.deadlock_detector_did_exceed_time_limit(&watcher);
                }
                let _ = rx.await;
            }
            watcher.completed.store(true, Ordering::SeqCst);
        });

        body(Completion { tx: Some(tx) });
        detector
    }
}

impl<C> DeadlockDetector<C> {
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the time limit passed before completion.
    pub fn has_exceeded_limit(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}
