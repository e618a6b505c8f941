//! De-duplicating, rate-limited work queue.
//!
//! Keys move through three sets:
//!
//! - **queued**: waiting for a worker, at most once each
//! - **processing**: handed out by [`WorkQueue::get`], not yet `done`
//! - **dirty**: added again while processing; re-queued on `done`
//!
//! A key is never handed to two workers at once. Failed keys come back
//! through [`WorkQueue::add_rate_limited`] after an exponential, per-key
//! delay that [`WorkQueue::forget`] resets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_secs_f64() * 2.0_f64.powi(attempt.min(62) as i32);
        let delay = delay.min(self.max.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter.min(1.0);
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay + jitter).clamp(0.0, self.max.as_secs_f64()))
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    inner: Mutex<Inner<K>>,
    /// Signalled when a key is queued or the queue shuts down.
    available: Notify,
    /// Signalled when a key leaves the processing set.
    idle: Notify,
    backoff: BackoffPolicy,
}

/// Work queue handle. Clones share the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        // The critical sections never panic; recover the data if one did.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.shared.available.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and no queued keys remain.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.queue.is_empty() {
                        self.shared.available.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark the processing of `key` finished. A key added while it was
    /// processing is queued again.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        let requeue = inner.dirty.contains(key);
        if requeue {
            inner.queue.push_back(key.clone());
        }
        let idle = inner.processing.is_empty();
        drop(inner);

        if requeue {
            self.shared.available.notify_one();
        }
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Queue `key` again after its backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let attempts = inner.failures.entry(key.clone()).or_insert(0);
            let delay = self.shared.backoff.delay(*attempts);
            *attempts += 1;
            delay
        };

        debug!(key = ?key, delay_ms = delay.as_millis() as u64, "Requeueing after backoff");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` again after `delay`, without counting it as a failure.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.shared.backoff
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop accepting keys. Workers drain what is queued, then `get`
    /// returns `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shared.available.notify_waiters();
    }

    /// Shut down and wait until no key is being processed.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.processing.is_empty() && inner.queue.is_empty() {
                    return;
                }
            }

            notified.await;
        }
    }
}
