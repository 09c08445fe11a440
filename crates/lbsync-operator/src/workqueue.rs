//! Sharded, deduplicating work queues
//!
//! A [`WorkQueue`] is a named set of shards, each drained by exactly one
//! worker. Every key is routed to a shard by a hash of its shard selector
//! (namespace for ingestion keys, tenant for model keys), so events for one
//! namespace are processed in order by the same worker while different
//! namespaces proceed in parallel.
//!
//! Each shard keeps three sets, like a classic controller work queue:
//!
//! - `queue`: keys waiting for a worker, FIFO
//! - `dirty`: keys that need processing (queued or re-added while in flight)
//! - `processing`: keys a worker currently holds
//!
//! Adding a key that is already dirty is a no-op. Adding a key that is being
//! processed marks it dirty; it is queued again when the worker calls `done`,
//! so the same key is never handled by two workers at once and a burst of
//! updates collapses into at most one follow-up run.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Extracts the part of a key that selects its shard
pub type ShardFn = fn(&str) -> &str;

/// Base delay of the per-key rate limiter used when a handler fails
const RATE_LIMIT_BASE: Duration = Duration::from_millis(5);

/// Maximum delay of the per-key rate limiter
const RATE_LIMIT_MAX: Duration = Duration::from_secs(60);

/// Polling interval of the idle waits
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Error returned by a [`KeyHandler`]; the key is re-added with rate limiting
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Processes keys popped from a queue
#[async_trait]
pub trait KeyHandler: Send + Sync + 'static {
    async fn handle(&self, key: &str) -> Result<(), HandlerError>;
}

#[derive(Default)]
struct ShardState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
}

#[derive(Default)]
struct Shard {
    state: Mutex<ShardState>,
    notify: Notify,
}

/// Named, sharded work queue with worker tasks
pub struct WorkQueue {
    name: String,
    shards: Vec<Shard>,
    shard_fn: ShardFn,
    shutting_down: AtomicBool,
    failures: Mutex<HashMap<String, u32>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Create a queue. The shard count is clamped to at least one.
    pub fn new(name: impl Into<String>, shard_count: usize, shard_fn: ShardFn) -> Arc<Self> {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Arc::new(Self {
            name: name.into(),
            shards,
            shard_fn,
            shutting_down: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a key
    pub fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        (self.shard_fn)(key).hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Add a key. Returns `false` if the key was already pending or the queue
    /// is shutting down.
    pub fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.is_shutting_down() {
            debug!(queue = %self.name, key = %key, "Queue shutting down, dropping key");
            return false;
        }

        let shard = &self.shards[self.shard_for(&key)];
        {
            let mut state = shard.state.lock();
            if state.dirty.contains(&key) {
                return false;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Requeued by done()
                return true;
            }
            state.queue.push_back(key);
        }
        shard.notify.notify_one();
        true
    }

    /// Add a key once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add a key after its per-key exponential backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let delay = backoff_delay(*count);
            *count = count.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset the rate limiter for a key
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Number of rate-limited re-adds since the key last succeeded
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Keys waiting for a worker across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.state.lock().queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a key is queued or being processed
    pub fn contains(&self, key: &str) -> bool {
        let state = self.shards[self.shard_for(key)].state.lock();
        state.dirty.contains(key) || state.processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether no key is queued or being processed. Keys scheduled with
    /// [`WorkQueue::add_after`] are not counted until they land.
    pub fn is_idle(&self) -> bool {
        self.shards.iter().all(|shard| {
            let state = shard.state.lock();
            state.queue.is_empty() && state.processing.is_empty()
        })
    }

    /// Wait until the queue is idle. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, || self.is_idle()).await
    }

    /// Wait until `key` is neither queued nor processing. Returns `false` on timeout.
    pub async fn wait_done(&self, key: &str, timeout: Duration) -> bool {
        self.wait_for(timeout, || !self.contains(key)).await
    }

    async fn wait_for(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let poll = async {
            while !condition() {
                tokio::time::sleep(IDLE_POLL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    async fn next(&self, shard_index: usize) -> Option<String> {
        let shard = &self.shards[shard_index];
        loop {
            let notified = shard.notify.notified();
            {
                let mut state = shard.state.lock();
                if self.is_shutting_down() {
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

    fn done(&self, shard_index: usize, key: &str) {
        let shard = &self.shards[shard_index];
        let requeued = {
            let mut state = shard.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            shard.notify.notify_one();
        }
    }

    /// Start one worker per shard with the given handler
    pub fn run<H: KeyHandler>(self: &Arc<Self>, handler: Arc<H>) {
        let mut workers = self.workers.lock();
        for shard_index in 0..self.shards.len() {
            let queue = Arc::clone(self);
            let handler = Arc::clone(&handler);
            workers.push(tokio::spawn(queue.worker_loop(shard_index, handler)));
        }
        info!(queue = %self.name, shards = self.shards.len(), "Started queue workers");
    }

    async fn worker_loop<H: KeyHandler>(self: Arc<Self>, shard: usize, handler: Arc<H>) {
        debug!(queue = %self.name, shard, "Worker started");
        while let Some(key) = self.next(shard).await {
            metrics::record_queue_item(&self.name);

            let result = AssertUnwindSafe(handler.handle(&key)).catch_unwind().await;
            match result {
                Ok(Ok(())) => self.forget(&key),
                Ok(Err(e)) => {
                    warn!(queue = %self.name, key = %key, error = %e, "Handler failed, requeueing");
                    metrics::record_handler_error(&self.name);
                    self.done(shard, &key);
                    self.add_rate_limited(key);
                    continue;
                }
                Err(_) => {
                    error!(queue = %self.name, key = %key, "Handler panicked, requeueing");
                    metrics::record_handler_error(&self.name);
                    self.done(shard, &key);
                    self.add_rate_limited(key);
                    continue;
                }
            }
            self.done(shard, &key);
        }
        debug!(queue = %self.name, shard, "Worker stopped");
    }

    /// Stop the queue. Workers finish the key they hold and exit; keys still
    /// waiting are dropped.
    pub async fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let pending = self.len();
        for shard in &self.shards {
            shard.notify.notify_waiters();
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(queue = %self.name, error = %e, "Worker task ended abnormally");
            }
        }
        info!(queue = %self.name, dropped = pending, "Queue stopped");
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(20));
    RATE_LIMIT_BASE.saturating_mul(factor).min(RATE_LIMIT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ingestion_shard_key, model_shard_key};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Records every key it sees
    struct Recorder {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl KeyHandler for Recorder {
        async fn handle(&self, key: &str) -> Result<(), HandlerError> {
            let _ = self.tx.send(key.to_string());
            Ok(())
        }
    }

    /// Fails the first N calls
    struct Flaky {
        remaining_failures: AtomicUsize,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl KeyHandler for Flaky {
        async fn handle(&self, key: &str) -> Result<(), HandlerError> {
            let _ = self.tx.send(key.to_string());
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlerError::new("backend unavailable"));
            }
            Ok(())
        }
    }

    struct Panicky {
        tx: mpsc::UnboundedSender<String>,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl KeyHandler for Panicky {
        async fn handle(&self, key: &str) -> Result<(), HandlerError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("handler bug");
            }
            let _ = self.tx.send(key.to_string());
            Ok(())
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("handler should be called")
            .expect("channel open")
    }

    #[test]
    fn test_same_namespace_same_shard() {
        let queue = WorkQueue::new("ingestion", 8, ingestion_shard_key);
        let a = queue.shard_for("L4LBService/payments/web");
        let b = queue.shard_for("L4LBService/payments/api");
        assert_eq!(a, b);
        assert!(a < queue.shard_count());
    }

    #[test]
    fn test_same_tenant_same_shard() {
        let queue = WorkQueue::new("graph", 8, model_shard_key);
        assert_eq!(
            queue.shard_for("admin/prod--a-web"),
            queue.shard_for("admin/prod--b-web")
        );
    }

    #[test]
    fn test_add_deduplicates_pending_keys() {
        let queue = WorkQueue::new("test", 1, model_shard_key);
        assert!(queue.add("admin/a"));
        assert!(!queue.add("admin/a"));
        assert!(queue.add("admin/b"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_deferred() {
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.add("admin/a");

        let key = queue.next(0).await.expect("key available");
        assert_eq!(key, "admin/a");

        // In flight: the repeat is remembered but not queued
        assert!(queue.add("admin/a"));
        assert_eq!(queue.len(), 0);
        assert!(queue.contains("admin/a"));

        // A burst collapses into one follow-up
        assert!(!queue.add("admin/a"));

        queue.done(0, &key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next(0).await.as_deref(), Some("admin/a"));
    }

    #[tokio::test]
    async fn test_fifo_within_shard() {
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.add("admin/a");
        queue.add("admin/b");
        queue.add("admin/c");

        assert_eq!(queue.next(0).await.as_deref(), Some("admin/a"));
        assert_eq!(queue.next(0).await.as_deref(), Some("admin/b"));
        assert_eq!(queue.next(0).await.as_deref(), Some("admin/c"));
    }

    #[tokio::test]
    async fn test_workers_invoke_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 4, ingestion_shard_key);
        queue.run(Arc::new(Recorder { tx }));

        queue.add("L4LBService/default/web");
        assert_eq!(recv(&mut rx).await, "L4LBService/default/web");

        queue.shut_down().await;
    }

    #[tokio::test]
    async fn test_failed_key_is_retried() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.run(Arc::new(Flaky {
            remaining_failures: AtomicUsize::new(2),
            tx,
        }));

        queue.add("admin/a");
        for _ in 0..3 {
            assert_eq!(recv(&mut rx).await, "admin/a");
        }

        // Give the worker a moment to mark success
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.num_requeues("admin/a"), 0);
        queue.shut_down().await;
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.run(Arc::new(Panicky {
            tx,
            panicked: AtomicBool::new(false),
        }));

        queue.add("admin/a");
        assert_eq!(recv(&mut rx).await, "admin/a");
        queue.shut_down().await;
    }

    #[tokio::test]
    async fn test_add_after_delays_key() {
        tokio::time::pause();
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.add_after("admin/a", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shut_down_rejects_new_keys() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 2, model_shard_key);
        queue.run(Arc::new(Recorder { tx }));
        queue.shut_down().await;

        assert!(queue.is_shutting_down());
        assert!(!queue.add("admin/a"));
    }

    #[tokio::test]
    async fn test_wait_idle_after_processing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 2, model_shard_key);
        assert!(queue.is_idle());

        queue.add("admin/a");
        queue.add("team-a/b");
        assert!(!queue.is_idle());

        queue.run(Arc::new(Recorder { tx }));
        recv(&mut rx).await;
        recv(&mut rx).await;
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert!(queue.wait_done("admin/a", Duration::from_secs(5)).await);
        queue.shut_down().await;
    }

    #[tokio::test]
    async fn test_wait_done_times_out_without_workers() {
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.add("admin/a");
        assert!(!queue.wait_done("admin/a", Duration::from_millis(120)).await);
        assert!(!queue.wait_idle(Duration::from_millis(120)).await);
    }

    #[tokio::test]
    async fn test_failing_key_requeued_with_backoff() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new("test", 1, model_shard_key);
        queue.run(Arc::new(Flaky {
            remaining_failures: AtomicUsize::new(2),
            tx,
        }));

        let start = tokio::time::Instant::now();
        queue.add("admin/a");
        assert_eq!(recv(&mut rx).await, "admin/a");
        assert_eq!(recv(&mut rx).await, "admin/a");
        assert!(start.elapsed() >= RATE_LIMIT_BASE);
        assert!(queue.num_requeues("admin/a") >= 1);

        assert_eq!(recv(&mut rx).await, "admin/a");
        assert!(start.elapsed() >= RATE_LIMIT_BASE * 3);

        assert!(queue.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(queue.num_requeues("admin/a"), 0);
        queue.shut_down().await;
    }

    /// Tracks how many keys of one namespace are in flight at once
    struct Overlap {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KeyHandler for Overlap {
        async fn handle(&self, key: &str) -> Result<(), HandlerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.seen.lock().push(key.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_in_one_namespace_runs_serially_in_order() {
        let handler = Arc::new(Overlap {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::new("ingestion", 4, ingestion_shard_key);
        let keys: Vec<String> = (0..20)
            .map(|i| format!("L4LBService/payments/svc-{i}"))
            .collect();
        for key in &keys {
            queue.add(key.as_str());
        }
        queue.run(handler.clone());

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.seen.lock(), keys);
        queue.shut_down().await;
    }

    #[test]
    fn test_shard_choice_is_stable() {
        let queue = WorkQueue::new("graph", 8, model_shard_key);
        let first = queue.shard_for("team-a/prod--x-web");
        for _ in 0..10 {
            assert_eq!(queue.shard_for("team-a/prod--x-web"), first);
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        assert_eq!(backoff_delay(0), RATE_LIMIT_BASE);
        assert_eq!(backoff_delay(1), RATE_LIMIT_BASE * 2);
        assert_eq!(backoff_delay(30), RATE_LIMIT_MAX);
    }
}
