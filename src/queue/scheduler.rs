//! Fixed-interval repeat jobs.

use super::job_queue::Queue;
use super::QueueError;
use crate::jobs::{JobOptions, JobPayload};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stable id shared by every occurrence of a repeat job.
pub fn repeat_job_id(queue: &str, payload: &JobPayload, every: Duration) -> String {
    format!("repeat:{}:{}:{}", queue, payload.kind(), every.as_millis())
}

#[derive(Default)]
struct Registered {
    ids: HashSet<String>,
    tasks: JoinSet<()>,
}

pub(crate) struct Scheduler {
    cancellation_token: CancellationToken,
    registered: Mutex<Option<Registered>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
            registered: Mutex::new(Some(Registered::default())),
        }
    }

    /// Enqueues `payload` under `id` every `every`, starting one interval from now. A tick
    /// is skipped while the previous occurrence is still live.
    pub fn register(
        &self,
        queue: Arc<Queue>,
        id: String,
        payload: JobPayload,
        options: JobOptions,
        every: Duration,
    ) -> Result<(), QueueError> {
        let mut guard = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        let Some(registered) = guard.as_mut() else {
            return Err(QueueError::ShuttingDown);
        };
        if !registered.ids.insert(id.clone()) {
            return Err(QueueError::DuplicateJob {
                queue: queue.name().to_string(),
                id,
            });
        }

        let token = self.cancellation_token.clone();
        info!(queue = %queue.name(), job_id = %id, every_ms = every.as_millis() as u64, "repeat job registered");
        registered.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let (job, delay) = queue.build_job(payload.clone(), &options, id.clone());
                match queue.add(job, delay).await {
                    Ok(_) => debug!(queue = %queue.name(), job_id = %id, "repeat job enqueued"),
                    Err(QueueError::DuplicateJob { .. }) => {
                        debug!(queue = %queue.name(), job_id = %id, "previous run still live, tick skipped")
                    }
                    Err(QueueError::ShuttingDown) => break,
                    Err(e) => warn!(queue = %queue.name(), job_id = %id, error = %e, "repeat enqueue failed"),
                }
            }
        });
        Ok(())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| r.ids.contains(id))
    }

    /// Stops every repeat task; later registrations are rejected.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut registered) = registered {
            while registered.tasks.join_next().await.is_some() {}
            debug!(count = registered.ids.len(), "repeat schedulers stopped");
        }
    }
}
