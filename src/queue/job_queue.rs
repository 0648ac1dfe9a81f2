use super::config::{DefaultDirectRateLimiter, QueueConfig};
use super::events::QueueEvent;
use super::sanitize::sanitize;
use super::state::{FailOutcome, QueueCounts, QueueState};
use super::QueueError;
use crate::cache_keys;
use crate::cache_store::{CacheStore, StoreError};
use crate::jobs::{Job, JobError, JobOptions, JobOutput, JobPayload, JobState};
use crate::metrics;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// TTL of broker job snapshots.
pub(crate) const MIRROR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

/// One named queue: job state, broker mirror and event fan-out. Worker pools and
/// schedulers operate on it through an `Arc`.
pub(crate) struct Queue {
    pub config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
    store: Arc<dyn CacheStore>,
    limiter: Option<DefaultDirectRateLimiter>,
    broker_healthy: AtomicBool,
    worker_paused: AtomicBool,
    closed: AtomicBool,
}

impl Queue {
    pub fn new(config: QueueConfig, store: Arc<dyn CacheStore>, events: broadcast::Sender<QueueEvent>) -> Self {
        let limiter = config.rate_limiter();
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
            store,
            limiter,
            broker_healthy: AtomicBool::new(true),
            worker_paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notifier(&self) -> &Notify {
        &self.notify
    }

    pub fn limiter(&self) -> Option<&DefaultDirectRateLimiter> {
        self.limiter.as_ref()
    }

    pub fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Builds a job record from `payload` and the resolved options.
    pub fn build_job(&self, payload: JobPayload, options: &JobOptions, id: String) -> (Job, Option<Duration>) {
        let resolved = self.config.resolve(options);
        let job = Job {
            id,
            kind: payload.kind(),
            queue: self.config.name.clone(),
            payload,
            priority: resolved.priority,
            attempts_made: 0,
            max_attempts: resolved.attempts,
            backoff: resolved.backoff,
            timeout_ms: resolved.timeout_ms,
            state: JobState::Waiting,
            parent_job_id: options.parent_job_id.clone(),
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            progress: 0,
            failed_reason: None,
            return_value: None,
            stalled_count: 0,
            repeat_every_ms: options.repeat.map(|r| r.every_ms),
            remove_on_complete: resolved.remove_on_complete,
            remove_on_fail: resolved.remove_on_fail,
        };
        (job, resolved.delay)
    }

    /// Accepts a job, mirrors it to the broker and wakes a worker. The job is rolled
    /// back when the mirror write fails.
    pub async fn add(&self, job: Job, delay: Option<Duration>) -> Result<Job, QueueError> {
        if self.is_closed() {
            return Err(QueueError::ShuttingDown);
        }
        let body = job.payload.body();
        let job = self.lock().insert(job, delay, Instant::now()).map_err(|existing| {
            metrics::increment_job_rejected("duplicate");
            QueueError::DuplicateJob {
                queue: self.config.name.clone(),
                id: existing.id,
            }
        })?;

        if let Err(e) = self.mirror(&job).await {
            self.lock().remove(&job.id);
            return Err(QueueError::Broker(e));
        }

        self.emit(QueueEvent::Waiting {
            queue: self.config.name.clone(),
            job_id: job.id.clone(),
            kind: job.kind,
            payload: sanitize(&body),
        });
        self.notify.notify_one();
        Ok(job)
    }

    /// Writes the job snapshot to the broker. A failure marks the queue broker-unhealthy.
    pub async fn mirror(&self, job: &Job) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(job).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let key = cache_keys::queue_job(&self.config.name, &job.id);
        match self.store.set(&key, bytes, Some(MIRROR_TTL)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_broker(false);
                error!(queue = %self.config.name, job_id = %job.id, error = %e, "broker write failed, queue marked unhealthy");
                Err(e)
            }
        }
    }

    /// Snapshot from the broker, for jobs no longer held in memory.
    pub async fn mirrored(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let key = cache_keys::queue_job(&self.config.name, id);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).ok()))
    }

    /// Drops broker snapshots of removed jobs.
    pub async fn forget(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let keys: Vec<String> = ids.iter().map(|id| cache_keys::queue_job(&self.config.name, id)).collect();
        if let Err(e) = self.store.delete(&keys).await {
            warn!(queue = %self.config.name, error = %e, count = keys.len(), "failed to delete job snapshots");
        }
    }

    pub fn has_ready(&self) -> bool {
        self.lock().has_ready(Instant::now())
    }

    pub fn take_next(&self) -> Option<(Job, u64)> {
        self.lock().take_next(Instant::now())
    }

    pub fn heartbeat(&self, id: &str, lease: u64) -> bool {
        self.lock().heartbeat(id, lease, Instant::now())
    }

    pub fn report_progress(&self, id: &str, lease: u64, progress: u8) {
        if self.lock().set_progress(id, lease, progress) {
            self.emit(QueueEvent::Progress {
                queue: self.config.name.clone(),
                job_id: id.to_string(),
                progress,
            });
        }
    }

    /// Records a successful attempt. A result from a superseded lease is discarded.
    pub async fn complete(&self, id: &str, lease: u64, output: &JobOutput, duration: Duration) {
        let finished = self.lock().complete(id, lease, output.to_json());
        let Some(finished) = finished else {
            debug!(queue = %self.config.name, job_id = %id, "discarding result of superseded attempt");
            return;
        };
        let job = &finished.job;
        let duration_ms = duration.as_millis() as u64;
        metrics::increment_job_completed(&self.config.name);
        metrics::record_job_duration(&self.config.name, duration);

        let errors = output.errors();
        if errors.is_empty() {
            info!(
                job_id = %job.id,
                queue = %self.config.name,
                kind = %job.kind,
                attempt = job.attempts_made,
                duration_ms,
                "job succeeded"
            );
        } else {
            warn!(
                job_id = %job.id,
                queue = %self.config.name,
                kind = %job.kind,
                attempt = job.attempts_made,
                duration_ms,
                partial_errors = errors.len(),
                first_error = %errors[0],
                "job succeeded with partial errors"
            );
        }

        let _ = self.mirror(job).await;
        self.forget(&finished.evicted).await;
        self.emit(QueueEvent::Completed {
            queue: self.config.name.clone(),
            job_id: job.id.clone(),
            duration_ms,
        });
    }

    /// Records a failed attempt; schedules a retry when the error allows one.
    pub async fn fail(&self, id: &str, lease: u64, err: &JobError, duration: Duration) {
        let reason = err.to_string();
        let outcome = self
            .lock()
            .fail(id, lease, reason.clone(), err.is_retryable(), Instant::now());
        let Some(outcome) = outcome else {
            debug!(queue = %self.config.name, job_id = %id, "discarding failure of superseded attempt");
            return;
        };
        let duration_ms = duration.as_millis() as u64;
        metrics::record_job_duration(&self.config.name, duration);

        match outcome {
            FailOutcome::Retry { job, delay } => {
                metrics::increment_job_retried(&self.config.name);
                warn!(
                    job_id = %job.id,
                    queue = %self.config.name,
                    kind = %job.kind,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    duration_ms,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "job attempt failed, retrying"
                );
                let _ = self.mirror(&job).await;
                self.emit(QueueEvent::Failed {
                    queue: self.config.name.clone(),
                    job_id: job.id.clone(),
                    reason,
                    attempts_made: job.attempts_made,
                    will_retry: true,
                });
            }
            FailOutcome::Failed(finished) => {
                let job = &finished.job;
                metrics::increment_job_failed(&self.config.name, err.label());
                error!(
                    job_id = %job.id,
                    queue = %self.config.name,
                    kind = %job.kind,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    duration_ms,
                    error_kind = err.label(),
                    error = %reason,
                    "job failed permanently"
                );
                let _ = self.mirror(job).await;
                self.forget(&finished.evicted).await;
                self.emit(QueueEvent::Failed {
                    queue: self.config.name.clone(),
                    job_id: job.id.clone(),
                    reason,
                    attempts_made: job.attempts_made,
                    will_retry: false,
                });
            }
        }
    }

    /// Re-queues or fails active jobs whose heartbeat went quiet.
    pub async fn check_stalled(&self) -> usize {
        let stalled = self.lock().check_stalled(
            Instant::now(),
            self.config.stalled_interval,
            self.config.max_stalled_count,
        );
        let count = stalled.len();
        for s in stalled {
            metrics::increment_job_stalled(&self.config.name);
            self.emit(QueueEvent::Stalled {
                queue: self.config.name.clone(),
                job_id: s.job.id.clone(),
                stalled_count: s.job.stalled_count,
            });
            let _ = self.mirror(&s.job).await;
            if s.failed {
                metrics::increment_job_failed(&self.config.name, "stalled");
                self.forget(&s.evicted).await;
                self.emit(QueueEvent::Failed {
                    queue: self.config.name.clone(),
                    job_id: s.job.id.clone(),
                    reason: s.job.failed_reason.clone().unwrap_or_default(),
                    attempts_made: s.job.attempts_made,
                    will_retry: false,
                });
            } else {
                self.notify.notify_one();
            }
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id)
    }

    pub fn children(&self, parent_id: &str) -> Vec<Job> {
        self.lock().children(parent_id)
    }

    pub async fn drain(&self, include_delayed: bool) -> Vec<String> {
        let removed = self.lock().drain(include_delayed);
        self.forget(&removed).await;
        removed
    }

    pub async fn clean(&self, grace: Duration, status: JobState) -> Vec<String> {
        let removed = self.lock().clean(grace, status, Utc::now());
        self.forget(&removed).await;
        removed
    }

    pub fn counts(&self) -> QueueCounts {
        self.lock().counts()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let c = state.counts();
        QueueStats {
            waiting: c.waiting,
            active: c.active,
            completed: c.completed,
            failed: c.failed,
            delayed: c.delayed,
            paused: state.paused,
        }
    }

    pub fn publish_depth(&self) {
        let c = self.counts();
        let name = &self.config.name;
        metrics::set_queue_depth(name, "waiting", c.waiting);
        metrics::set_queue_depth(name, "active", c.active);
        metrics::set_queue_depth(name, "delayed", c.delayed);
        metrics::set_queue_depth(name, "completed", c.completed);
        metrics::set_queue_depth(name, "failed", c.failed);
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn pause_worker(&self) {
        self.worker_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_worker(&self) {
        self.worker_paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_worker_paused(&self) -> bool {
        self.worker_paused.load(Ordering::SeqCst)
    }

    pub fn is_broker_healthy(&self) -> bool {
        self.broker_healthy.load(Ordering::SeqCst)
    }

    fn mark_broker(&self, healthy: bool) {
        let was = self.broker_healthy.swap(healthy, Ordering::SeqCst);
        if was != healthy {
            metrics::set_broker_healthy(&self.config.name, healthy);
            if healthy {
                info!(queue = %self.config.name, "broker reachable again, queue healthy");
            }
        }
    }

    /// Pings the broker and updates the health flag.
    pub async fn check_broker(&self) -> bool {
        let ok = self.store.ping().await.is_ok();
        self.mark_broker(ok);
        ok
    }

    /// Whether a worker may dequeue right now.
    pub async fn can_dequeue(&self) -> bool {
        if self.is_closed() || self.is_paused() || self.is_worker_paused() {
            return false;
        }
        self.is_broker_healthy() || self.check_broker().await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
