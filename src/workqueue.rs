use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fnv::{FnvHashMap, FnvHashSet};
use tokio::sync::Notify;
use tracing::*;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    fn delay(&self, failures: u32) -> Duration {
        // anything above 2^32 is over any sane cap anyway
        let factor = 2u32.checked_pow(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// A deduplicating work queue with per-key rate limited retries.
///
/// A key is delivered to at most one worker at a time: a key added while it is being processed
/// is queued again only once the worker calls [`WorkQueue::done`].
pub struct WorkQueue<K> {
    name: &'static str,
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: ItemExponentialBackoff,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: FnvHashSet<K>,
    processing: FnvHashSet<K>,
    failures: FnvHashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str, rate_limiter: ItemExponentialBackoff) -> Self {
        Self {
            name,
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: FnvHashSet::default(),
                    processing: FnvHashSet::default(),
                    failures: FnvHashMap::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner.state.lock().expect("work queue mutex poisoned")
    }

    /// Enqueues the key unless it is already waiting to be processed.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // picked up again by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            // registered before checking the state so a concurrent add or shutdown is not missed
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the key as processed, re-queueing it if it was added in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds the key after the given delay.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds the key after its backoff delay and counts one more failure for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.rate_limiter.delay(*failures);
            *failures += 1;
            delay
        };
        trace!(queue = self.name, ?key, ?delay, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Number of rate limited re-adds since the key was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Stops tracking retries for the key.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Stops accepting keys. Keys already queued are still handed out, after which every
    /// waiting [`WorkQueue::get`] returns `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        debug!(queue = self.name, "Shutting down work queue");
        self.inner.notify.notify_waiters();
    }
}
