//! Worker pool serving one queue.

use super::events::QueueEvent;
use super::job_queue::Queue;
use crate::jobs::{Job, JobError};
use crate::processors::{HandlerRegistry, JobContext, ProgressSink};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Forwards handler progress into the queue's job record and event stream, for the
/// attempt holding `lease` only.
struct QueueProgress {
    queue: Arc<Queue>,
    lease: u64,
}

impl ProgressSink for QueueProgress {
    fn report(&self, job_id: &str, progress: u8) {
        self.queue.report_progress(job_id, self.lease, progress);
    }
}

pub(crate) struct WorkerPool {
    queue: Arc<Queue>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Spawns `concurrency` workers plus the stalled-job checker for `queue`.
    pub fn start(queue: Arc<Queue>, handlers: HandlerRegistry) -> Self {
        let concurrency = queue.config.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let cancellation_token = CancellationToken::new();
        let handlers = Arc::new(handlers);
        let mut join_set = JoinSet::new();

        info!(queue = %queue.name(), concurrency, "starting worker pool");

        for i in 0..concurrency {
            let queue = queue.clone();
            let semaphore = semaphore.clone();
            let cancellation_token = cancellation_token.clone();
            let handlers = handlers.clone();

            join_set.spawn(async move {
                debug!(queue = %queue.name(), worker = i, "worker started");
                let poll_interval = queue.config.poll_interval;
                let mut idle = true;

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    if idle {
                        tokio::select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = queue.notifier().notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    idle = true;

                    if !queue.can_dequeue().await {
                        continue;
                    }
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if !queue.has_ready() {
                        continue;
                    }
                    if let Some(limiter) = queue.limiter() {
                        tokio::select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = limiter.until_ready() => {}
                        }
                    }
                    let Some((job, lease)) = queue.take_next() else {
                        continue;
                    };

                    run_job(&queue, &handlers, job, lease).await;
                    drop(permit);
                    idle = false;
                }
                debug!(queue = %queue.name(), worker = i, "worker stopped");
            });
        }

        let checker_queue = queue.clone();
        let checker_token = cancellation_token.clone();
        join_set.spawn(async move {
            let every = (checker_queue.config.stalled_interval / 2).max(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = checker_token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                let stalled = checker_queue.check_stalled().await;
                if stalled > 0 {
                    warn!(queue = %checker_queue.name(), stalled, "re-queued stalled jobs");
                }
            }
        });

        Self {
            queue,
            cancellation_token,
            tasks: Mutex::new(Some(join_set)),
        }
    }

    /// Stops dequeuing and waits for in-flight jobs, aborting whatever is still running
    /// after `grace`. Returns false when jobs had to be aborted.
    pub async fn stop(&self, grace: Duration) -> bool {
        info!(queue = %self.queue.name(), "stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.take()
        };
        let Some(mut join_set) = join_set else {
            return true;
        };

        let drained = tokio::time::timeout(grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                queue = %self.queue.name(),
                grace_ms = grace.as_millis() as u64,
                "in-flight jobs did not finish within the grace period, aborting"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        info!(queue = %self.queue.name(), "worker pool stopped");
        drained
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

/// Runs one attempt under the job's execution budget, renewing its heartbeat meanwhile.
async fn run_job(queue: &Arc<Queue>, handlers: &HandlerRegistry, job: Job, lease: u64) {
    let started = Instant::now();
    let attempt = job.attempts_made + 1;
    let _ = queue.mirror(&job).await;
    queue.emit(QueueEvent::Active {
        queue: queue.name().to_string(),
        job_id: job.id.clone(),
        attempt,
    });

    let Some(handler) = handlers.get(job.kind) else {
        error!(job_id = %job.id, queue = %queue.name(), kind = %job.kind, "no handler registered");
        let err = JobError::InvalidPayload(format!("no handler registered for {}", job.kind));
        queue.fail(&job.id, lease, &err, started.elapsed()).await;
        return;
    };

    debug!(job_id = %job.id, queue = %queue.name(), kind = %job.kind, attempt, "processing job");
    let ctx = JobContext::new(job.id.clone(), queue.name(), job.kind, attempt, job.max_attempts)
        .with_sink(Arc::new(QueueProgress {
            queue: queue.clone(),
            lease,
        }));
    let budget = Duration::from_millis(job.timeout_ms);

    let run = tokio::time::timeout(budget, handler.handle(&ctx, job.payload.clone()));
    tokio::pin!(run);
    let mut renew = tokio::time::interval(queue.config.lock_renew);
    renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            res = &mut run => break res,
            _ = renew.tick() => {
                queue.heartbeat(&job.id, lease);
            }
        }
    };

    match outcome {
        Ok(Ok(output)) => queue.complete(&job.id, lease, &output, started.elapsed()).await,
        Ok(Err(err)) => queue.fail(&job.id, lease, &err, started.elapsed()).await,
        Err(_) => {
            let err = JobError::Timeout(job.timeout_ms);
            queue.fail(&job.id, lease, &err, started.elapsed()).await;
        }
    }
}
