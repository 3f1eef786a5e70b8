//! Debounced key batching
//!
//! Keys pushed within one coalescing window are delivered together as a
//! single batch. A key is never queued twice while it is pending or in
//! flight, and a completed key is not requested again. Releasing a failed
//! batch lets its keys be queued anew.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Default)]
struct BatchState {
    queued: BTreeSet<String>,
    in_flight: HashSet<String>,
    completed: HashSet<String>,
    flush_scheduled: bool,
}

#[derive(Debug)]
struct Inner {
    name: &'static str,
    window: Duration,
    state: Mutex<BatchState>,
    ready: mpsc::UnboundedSender<Vec<String>>,
}

/// Coalesces keys into batches delivered on a channel.
#[derive(Debug, Clone)]
pub struct BatchQueue {
    inner: Arc<Inner>,
}

impl BatchQueue {
    /// Create a queue and the receiver its batches are delivered on.
    pub fn new(name: &'static str, window: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<String>>) {
        let (ready, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            name,
            window,
            state: Mutex::new(BatchState::default()),
            ready,
        });
        (Self { inner }, rx)
    }

    /// Queue `key`. Returns false if it is already queued, in flight or done.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn push(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.queued.contains(&key)
            || state.in_flight.contains(&key)
            || state.completed.contains(&key)
        {
            return false;
        }
        state.queued.insert(key);

        if !state.flush_scheduled {
            state.flush_scheduled = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(inner.window).await;
                inner.flush();
            });
        }
        true
    }

    /// Mark `keys` as fetched.
    pub fn complete(&self, keys: &[String]) {
        let mut state = self.inner.state.lock();
        for key in keys {
            state.in_flight.remove(key);
            state.completed.insert(key.clone());
        }
    }

    /// Return `keys` to the unrequested state after a failed fetch.
    pub fn release(&self, keys: &[String]) {
        let mut state = self.inner.state.lock();
        for key in keys {
            state.in_flight.remove(key);
        }
    }

    /// Forget that `key` was fetched so it can be requested again.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().completed.remove(key);
    }

    /// Keys waiting for the current window to close.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queued.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Keys fetched and not forgotten since.
    pub fn completed(&self) -> usize {
        self.inner.state.lock().completed.len()
    }
}

impl Inner {
    fn flush(&self) {
        let batch: Vec<String> = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            let batch: Vec<String> = std::mem::take(&mut state.queued).into_iter().collect();
            state.in_flight.extend(batch.iter().cloned());
            batch
        };
        if batch.is_empty() {
            return;
        }
        trace!("Flushing {} batch of {} keys", self.name, batch.len());
        if let Err(mpsc::error::SendError(batch)) = self.ready.send(batch) {
            // Nobody is consuming batches anymore
            self.state.lock().in_flight.retain(|k| !batch.contains(k));
        }
    }
}
