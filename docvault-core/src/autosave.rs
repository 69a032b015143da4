//! Single-shot autosave timer.
//!
//! At most one timer is pending. Arming again replaces the pending timer, so
//! a burst of changes produces one autosave after the last of them.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct AutosaveScheduler {
    runtime: Handle,
    pending: Arc<Mutex<Option<Pending>>>,
    generation: Mutex<u64>,
}

impl AutosaveScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Arc::new(Mutex::new(None)),
            generation: Mutex::new(0),
        }
    }

    /// Run `fire` once after `delay`, replacing any pending timer.
    pub fn schedule<F>(&self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };

        let pending = self.pending.clone();
        let mut slot = self.pending.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut slot = pending.lock();
                match slot.as_ref() {
                    Some(p) if p.generation == generation => slot.take().is_some(),
                    _ => false,
                }
            };
            if current {
                fire();
            }
        });
        *slot = Some(Pending { generation, handle });
    }

    /// Disarm the pending timer. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
