use crate::jobs::{BackoffPolicy, DefaultJobOptions, JobKind, JobOptions, RateLimit};
use crate::settings::QueueSettings;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

pub(crate) type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Resolved configuration of one named queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Kinds this queue accepts
    pub kinds: Vec<JobKind>,
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub defaults: DefaultJobOptions,
    pub poll_interval: Duration,
    pub lock_renew: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
}

impl QueueConfig {
    /// Queue named after `kind`, with the kind's retry preset and any configured override applied.
    pub fn for_kind(kind: JobKind, settings: &QueueSettings) -> Self {
        let name = kind.default_queue().to_string();
        let d = &settings.defaults;
        let preset = kind.retry_preset();
        let o = settings.overrides.get(&name).cloned().unwrap_or_default();

        Self {
            kinds: vec![kind],
            concurrency: o.concurrency.unwrap_or(d.concurrency).max(1),
            rate_limit: o.rate_limit,
            defaults: DefaultJobOptions {
                priority: preset.priority,
                attempts: o.attempts.unwrap_or(preset.attempts).max(1),
                backoff: o.backoff.unwrap_or(preset.backoff),
                timeout_ms: o.job_timeout_ms.or(d.job_timeout_ms).unwrap_or(preset.timeout_ms).max(1),
                remove_on_complete: o.remove_on_complete.or(d.remove_on_complete),
                remove_on_fail: o.remove_on_fail.or(d.remove_on_fail),
            },
            poll_interval: Duration::from_millis(d.poll_interval_ms.max(1)),
            lock_renew: Duration::from_millis(d.lock_renew_ms.max(1)),
            stalled_interval: Duration::from_millis(d.stalled_interval_ms.max(1)),
            max_stalled_count: d.max_stalled_count,
            name,
        }
    }

    /// One queue per job kind.
    pub fn all(settings: &QueueSettings) -> Vec<Self> {
        JobKind::ALL.iter().map(|k| Self::for_kind(*k, settings)).collect()
    }

    pub fn accepts(&self, kind: JobKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Fills unset enqueue options from the queue defaults.
    pub fn resolve(&self, options: &JobOptions) -> ResolvedOptions {
        ResolvedOptions {
            priority: options.priority.unwrap_or(self.defaults.priority),
            delay: options.delay_ms.map(Duration::from_millis),
            attempts: options.attempts.unwrap_or(self.defaults.attempts).max(1),
            backoff: options.backoff.unwrap_or(self.defaults.backoff),
            timeout_ms: options.timeout_ms.unwrap_or(self.defaults.timeout_ms).max(1),
            remove_on_complete: options.remove_on_complete.or(self.defaults.remove_on_complete),
            remove_on_fail: options.remove_on_fail.or(self.defaults.remove_on_fail),
        }
    }

    /// Direct limiter allowing `max` starts per `duration_ms`, bursting up to `max`.
    pub(crate) fn rate_limiter(&self) -> Option<DefaultDirectRateLimiter> {
        let rl = self.rate_limit?;
        let max = NonZeroU32::new(rl.max)?;
        let period = Duration::from_millis((rl.duration_ms / u64::from(rl.max)).max(1));
        let quota = Quota::with_period(period)?.allow_burst(max);
        Some(RateLimiter::direct(quota))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub priority: i32,
    pub delay: Option<Duration>,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}
