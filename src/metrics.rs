// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Registers descriptions for every metric. Call once at startup.
pub fn describe_metrics() {
    describe_gauge!("job_runner_up", "Process liveness (1=up).");

    // Jobs
    describe_counter!(
        "jobs_completed_total",
        Unit::Count,
        "Jobs that finished successfully, labeled by queue."
    );
    describe_counter!(
        "jobs_failed_total",
        Unit::Count,
        "Jobs that failed permanently, labeled by queue and error kind."
    );
    describe_counter!(
        "jobs_retried_total",
        Unit::Count,
        "Failed attempts scheduled for another try, labeled by queue."
    );
    describe_counter!(
        "jobs_stalled_total",
        Unit::Count,
        "Active jobs whose heartbeat expired, labeled by queue."
    );
    describe_counter!(
        "jobs_rejected_total",
        Unit::Count,
        "Enqueue calls rejected (duplicate id, shutting down, unknown queue)."
    );
    describe_histogram!(
        "job_duration_ms",
        "Wall-clock duration of one job attempt in milliseconds."
    );
    describe_gauge!("queue_jobs", "Jobs per queue and state.");
    describe_gauge!("queue_broker_healthy", "Broker reachability per queue (1=healthy).");

    // Cache
    describe_counter!("cache_hits_total", Unit::Count, "Cache hits by namespace.");
    describe_counter!("cache_miss_total", Unit::Count, "Cache misses by namespace.");
    describe_counter!(
        "cache_stale_served_total",
        Unit::Count,
        "Stale READ_HEAVY entries served while a refresh runs."
    );
    describe_counter!(
        "cache_refresh_triggered_total",
        Unit::Count,
        "Background refreshes triggered by stale reads."
    );
    describe_counter!(
        "cache_invalidated_keys_total",
        Unit::Count,
        "Keys evicted by invalidation, labeled by reason."
    );
    describe_counter!(
        "source_fetch_failures_total",
        Unit::Count,
        "Failed external fetches, labeled by source."
    );
}

// --- Jobs ---

pub fn increment_job_completed(queue: &str) {
    counter!("jobs_completed_total", 1, "queue" => queue.to_string());
}

pub fn increment_job_failed(queue: &str, error_kind: &'static str) {
    counter!("jobs_failed_total", 1, "queue" => queue.to_string(), "error" => error_kind);
}

pub fn increment_job_retried(queue: &str) {
    counter!("jobs_retried_total", 1, "queue" => queue.to_string());
}

pub fn increment_job_stalled(queue: &str) {
    counter!("jobs_stalled_total", 1, "queue" => queue.to_string());
}

pub fn increment_job_rejected(reason: &'static str) {
    counter!("jobs_rejected_total", 1, "reason" => reason);
}

pub fn record_job_duration(queue: &str, duration: Duration) {
    histogram!("job_duration_ms", duration.as_secs_f64() * 1000.0, "queue" => queue.to_string());
}

pub fn set_queue_depth(queue: &str, state: &'static str, count: usize) {
    gauge!("queue_jobs", count as f64, "queue" => queue.to_string(), "state" => state);
}

pub fn set_broker_healthy(queue: &str, healthy: bool) {
    gauge!("queue_broker_healthy", if healthy { 1.0 } else { 0.0 }, "queue" => queue.to_string());
}

// --- Cache ---

pub fn increment_cache_hit(namespace: &str) {
    counter!("cache_hits_total", 1, "namespace" => namespace.to_string());
}

pub fn increment_cache_miss(namespace: &str) {
    counter!("cache_miss_total", 1, "namespace" => namespace.to_string());
}

pub fn increment_cache_stale_served(namespace: &str) {
    counter!("cache_stale_served_total", 1, "namespace" => namespace.to_string());
}

pub fn increment_cache_refresh_triggered(namespace: &str) {
    counter!("cache_refresh_triggered_total", 1, "namespace" => namespace.to_string());
}

pub fn increment_cache_invalidated(reason: &str, count: u64) {
    counter!("cache_invalidated_keys_total", count, "reason" => reason.to_string());
}

pub fn increment_source_failure(source: &str) {
    counter!("source_fetch_failures_total", 1, "source" => source.to_string());
}

pub fn record_heartbeat() {
    gauge!("job_runner_up", 1.0);
}
