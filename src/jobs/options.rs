// Job options - enqueue options, backoff math and per-kind retry presets

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for any computed retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Delay policy between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts already finished.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms).min(MAX_BACKOFF),
            BackoffPolicy::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(20);
                let factor = 1u64 << exp;
                Duration::from_millis(delay_ms.saturating_mul(factor)).min(MAX_BACKOFF)
            }
        }
    }
}

/// `max` jobs started per `duration_ms` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub every_ms: u64,
}

/// Caller-supplied enqueue options. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Higher runs first; equal priorities are FIFO
    pub priority: Option<i32>,
    pub delay_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub repeat: Option<RepeatOptions>,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
    /// Stable id; a live job with the same id rejects the enqueue
    pub job_id: Option<String>,
    pub parent_job_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn repeat_every(mut self, every: Duration) -> Self {
        self.repeat = Some(RepeatOptions {
            every_ms: every.as_millis() as u64,
        });
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(parent_job_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn remove_on_complete(mut self, keep: usize) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn remove_on_fail(mut self, keep: usize) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }
}

/// Fully resolved defaults a queue applies to every job it accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultJobOptions {
    pub priority: i32,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

/// Retry/timeout preset for one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPreset {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
    pub priority: i32,
}
