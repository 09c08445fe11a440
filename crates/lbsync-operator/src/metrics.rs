//! Metric helpers
//!
//! A Prometheus recorder is installed once at boot; the health server renders
//! it on `/metrics`. Without a recorder every helper is a no-op, which is what
//! unit tests rely on.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to install Prometheus recorder: {0}")]
    Install(String),
}

/// Install the global Prometheus recorder
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))
}

/// A key was popped by a queue worker
pub fn record_queue_item(queue: &str) {
    counter!("lbsync_queue_items_total", "queue" => queue.to_string()).increment(1);
}

/// A queue handler returned an error or panicked
pub fn record_handler_error(queue: &str) {
    counter!("lbsync_queue_handler_errors_total", "queue" => queue.to_string()).increment(1);
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!("lbsync_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

/// Record one backend REST call
pub fn record_backend_request(object_type: &str, operation: &str, status: &str, duration: Duration) {
    counter!("lbsync_backend_requests_total",
        "object_type" => object_type.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("lbsync_backend_request_duration_seconds",
        "object_type" => object_type.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_retry(tier: &str) {
    counter!("lbsync_retries_total", "tier" => tier.to_string()).increment(1);
}

pub fn record_validation_rejection() {
    counter!("lbsync_validation_rejections_total").increment(1);
}

pub fn record_full_sync(trigger: &str, duration: Duration) {
    counter!("lbsync_full_sync_total", "trigger" => trigger.to_string()).increment(1);
    histogram!("lbsync_full_sync_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_stale_deleted(object_type: &str) {
    counter!("lbsync_stale_objects_deleted_total", "object_type" => object_type.to_string())
        .increment(1);
}

pub fn set_graph_models(count: usize) {
    gauge!("lbsync_graph_models").set(count as f64);
}

pub fn set_cache_objects(object_type: &str, count: usize) {
    gauge!("lbsync_cache_objects", "object_type" => object_type.to_string()).set(count as f64);
}

/// Timer for a backend call, recorded on [`BackendTimer::finish`]
pub struct BackendTimer {
    start: Instant,
    object_type: &'static str,
    operation: &'static str,
}

impl BackendTimer {
    pub fn start(object_type: &'static str, operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            object_type,
            operation,
        }
    }

    pub fn finish(self, status: &str) {
        let duration = self.start.elapsed();
        debug!(
            object_type = self.object_type,
            operation = self.operation,
            status = %status,
            duration_ms = %duration.as_millis(),
            "backend request"
        );
        record_backend_request(self.object_type, self.operation, status, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        record_queue_item("graph");
        record_handler_error("graph");
        set_queue_depth("graph", 3);
        record_retry("fast");
        record_validation_rejection();
        record_full_sync("boot", Duration::from_millis(5));
        record_stale_deleted("virtualservice");
        set_graph_models(2);
        set_cache_objects("pool", 7);
    }

    #[test]
    fn test_backend_timer_finish() {
        let timer = BackendTimer::start("pool", "create");
        std::thread::sleep(Duration::from_millis(1));
        timer.finish("201");
    }
}
