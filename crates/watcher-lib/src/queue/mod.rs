//! Deduplicating, rate-limited work queue
//!
//! Keys are coalesced: a key that is already waiting is not queued twice,
//! and a key that is being processed is only marked dirty so it is
//! re-queued once the worker calls [`WorkQueue::done`]. With a single
//! distinct key this turns any burst of notifications into at most one
//! pending and one in-flight unit of work.

mod rate_limiter;


pub use rate_limiter::{
    default_controller_rate_limiter, BackoffConfig, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Bounds required of a queue key
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

#[derive(Debug)]
struct QueueState<K> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    available: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue using the default controller rate limiter
    pub fn new(name: impl Into<String>, backoff: &BackoffConfig) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter(backoff)))
    }

    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                rate_limiter,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    ///
    /// No-op if the key is already waiting or the queue is shutting down.
    /// If the key is in flight it is re-queued when the worker calls `done`.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            trace!(queue = %self.inner.name, key = ?key, "Ignoring add on shut down queue");
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(queue = %self.inner.name, key = ?key, "Key already pending");
            return;
        }
        if state.processing.contains(&key) {
            trace!(queue = %self.inner.name, key = ?key, "Key in flight, marked dirty");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down. The caller owns the
    /// key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shut_down cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key obtained from `get`
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.available.notify_one();
        }
    }

    /// Clear retry history for `key`
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Number of failed attempts recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Re-add `key` after the rate limiter's delay; returns that delay
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = delay.as_millis() as u64,
            "Scheduling rate limited retry"
        );
        self.add_after(key, delay);
        delay
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys.
    ///
    /// Blocked and future `get` calls return `None`; keys already handed
    /// out may still be released with `done`.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
        }
        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
