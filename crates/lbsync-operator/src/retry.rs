//! Retry classification and tiered backoff for convergence failures
//!
//! A failed model key is classified, its retry counter in the graph store is
//! incremented, and the key is parked on one of two retry queues whose only
//! job is to hand it back to the graph queue once the delay elapsed:
//!
//! - fast tier: exponential backoff for a bounded number of attempts
//! - slow tier: fixed interval, unbounded
//!
//! Validation errors are never retried; the key waits for a new ingestion
//! event. Capacity and availability errors skip the fast tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::backend::BackendError;
use crate::config::RetryConfig;
use crate::engine::ConvergeError;
use crate::graph::GraphStore;
use crate::keys::ModelKey;
use crate::metrics;
use crate::workqueue::{HandlerError, KeyHandler, WorkQueue};

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected input; retrying cannot succeed without a cluster change
    Validation,
    /// Likely to clear quickly: timeouts, 5xx, conflicts
    Transient,
    /// Backend capacity or availability: quota, no free IP, upgrade in progress
    Unavailable,
}

/// What to do with a failed key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Drop the key until the next ingestion event or full sync
    Reject,
    Fast(Duration),
    Slow(Duration),
}

impl RetryDecision {
    pub fn tier(&self) -> &'static str {
        match self {
            Self::Reject => "none",
            Self::Fast(_) => "fast",
            Self::Slow(_) => "slow",
        }
    }
}

/// Backend messages that signal exhausted capacity or a controller that is
/// not accepting changes
const UNAVAILABLE_MARKERS: &[&str] = &[
    "no free ip",
    "no available ip",
    "insufficient ip",
    "upgrade in progress",
    "upgrade is in progress",
    "rate limit",
    "quota",
];

/// Classify a backend client error
pub fn classify_backend(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Http(_) | BackendError::Parse(_) => ErrorClass::Transient,
        BackendError::Config(_) => ErrorClass::Validation,
        BackendError::Api { status, message } => {
            let message = message.to_lowercase();
            if UNAVAILABLE_MARKERS.iter().any(|marker| message.contains(marker)) {
                return ErrorClass::Unavailable;
            }
            match status {
                400 | 403 | 422 => ErrorClass::Validation,
                401 | 429 | 503 => ErrorClass::Unavailable,
                _ => ErrorClass::Transient,
            }
        }
    }
}

/// Classify a convergence failure
pub fn classify(error: &ConvergeError) -> ErrorClass {
    match error {
        ConvergeError::Backend { source, .. } => classify_backend(source),
        ConvergeError::MissingReference { .. } | ConvergeError::Key(_) => ErrorClass::Validation,
        ConvergeError::VrfUnavailable(_) => ErrorClass::Unavailable,
        ConvergeError::DeletePending { .. }
        | ConvergeError::DependencyMissing { .. }
        | ConvergeError::InvalidResponse { .. } => ErrorClass::Transient,
    }
}

/// Backoff curves for the two tiers
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub fast_base_delay: Duration,
    pub fast_max_delay: Duration,
    pub fast_max_attempts: u32,
    pub slow_interval: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            fast_base_delay: Duration::from_millis(config.fast_base_delay_millis),
            fast_max_delay: Duration::from_secs(config.fast_max_delay_seconds),
            fast_max_attempts: config.fast_max_attempts,
            slow_interval: Duration::from_secs(config.slow_interval_seconds),
        }
    }
}

impl RetryPolicy {
    /// Decide the retry for the `attempt`-th consecutive failure (1-based)
    pub fn compute_backoff(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::Validation => RetryDecision::Reject,
            ErrorClass::Unavailable => RetryDecision::Slow(self.slow_interval),
            ErrorClass::Transient if attempt > self.fast_max_attempts => {
                RetryDecision::Slow(self.slow_interval)
            }
            ErrorClass::Transient => {
                // base, 2*base, 4*base, ... up to the cap
                let exponent = attempt.saturating_sub(1).min(31);
                let delay = self
                    .fast_base_delay
                    .saturating_mul(2u32.saturating_pow(exponent));
                RetryDecision::Fast(delay.min(self.fast_max_delay))
            }
        }
    }
}

/// Routes failed keys to the retry queues
pub struct RetryClassifier {
    policy: RetryPolicy,
    store: Arc<GraphStore>,
    fast_queue: Arc<WorkQueue>,
    slow_queue: Arc<WorkQueue>,
}

impl RetryClassifier {
    pub fn new(
        policy: RetryPolicy,
        store: Arc<GraphStore>,
        fast_queue: Arc<WorkQueue>,
        slow_queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            policy,
            store,
            fast_queue,
            slow_queue,
        }
    }

    /// Classify a failure and schedule the retry, if any
    pub fn schedule(&self, key: &ModelKey, err: &ConvergeError) -> RetryDecision {
        let class = classify(err);
        if class == ErrorClass::Validation {
            error!(model_key = %key, error = %err, "Convergence rejected, not retrying");
            metrics::record_validation_rejection();
            return RetryDecision::Reject;
        }

        let attempt = self.store.increment_retry(key);
        let decision = self.policy.compute_backoff(attempt, class);
        match decision {
            RetryDecision::Fast(delay) => {
                warn!(model_key = %key, attempt, tier = "fast", delay_ms = delay.as_millis() as u64, error = %err, "Scheduling retry");
                self.fast_queue.add_after(key.to_string(), delay);
            }
            RetryDecision::Slow(delay) => {
                warn!(model_key = %key, attempt, tier = "slow", delay_secs = delay.as_secs(), error = %err, "Scheduling retry");
                self.slow_queue.add_after(key.to_string(), delay);
            }
            RetryDecision::Reject => {}
        }
        metrics::record_retry(decision.tier());
        decision
    }
}

/// Handler for the retry queues: hands keys back to the graph queue
pub struct RequeueHandler {
    graph_queue: Arc<WorkQueue>,
}

impl RequeueHandler {
    pub fn new(graph_queue: Arc<WorkQueue>) -> Self {
        Self { graph_queue }
    }
}

#[async_trait]
impl KeyHandler for RequeueHandler {
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        debug!(model_key = %key, "Re-enqueueing retried key");
        self.graph_queue.add(key);
        Ok(())
    }
}
