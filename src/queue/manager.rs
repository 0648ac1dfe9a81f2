use super::config::QueueConfig;
use super::events::{run_listener, QueueEvent, EVENT_CHANNEL_CAPACITY};
use super::job_queue::{Queue, QueueStats};
use super::scheduler::{repeat_job_id, Scheduler};
use super::worker::WorkerPool;
use super::QueueError;
use crate::cache_store::CacheStore;
use crate::jobs::{Job, JobHandle, JobKind, JobOptions, JobPayload, JobState};
use crate::metrics;
use crate::processors::HandlerRegistry;
use crate::settings::Settings;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// `{healthy, queues: {name: bool}, broker}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub queues: BTreeMap<String, bool>,
    pub broker: bool,
}

/// Owns every named queue with its worker pool, the repeat scheduler and the event
/// listener.
pub struct QueueManager {
    queues: HashMap<String, Arc<Queue>>,
    pools: Vec<WorkerPool>,
    store: Arc<dyn CacheStore>,
    events: broadcast::Sender<QueueEvent>,
    scheduler: Scheduler,
    listener_token: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    shutdown_grace: Duration,
}

impl QueueManager {
    /// Builds the queues and starts their workers. Fails when a configured kind has no
    /// handler in `handlers`.
    pub fn start(
        configs: Vec<QueueConfig>,
        handlers: HandlerRegistry,
        store: Arc<dyn CacheStore>,
        shutdown_grace: Duration,
    ) -> Result<Self, QueueError> {
        let missing = handlers.missing(configs.iter().flat_map(|c| c.kinds.iter()));
        if !missing.is_empty() {
            return Err(QueueError::MissingHandlers(missing));
        }

        let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut queues = HashMap::with_capacity(configs.len());
        let mut pools = Vec::with_capacity(configs.len());
        for config in configs {
            let queue = Arc::new(Queue::new(config, store.clone(), events.clone()));
            metrics::set_broker_healthy(queue.name(), true);
            pools.push(WorkerPool::start(queue.clone(), handlers.clone()));
            queues.insert(queue.name().to_string(), queue);
        }

        let listener_token = CancellationToken::new();
        let depth_queues = queues.clone();
        let listener = tokio::spawn(run_listener(rx, listener_token.clone(), move |event: &QueueEvent| {
            if let Some(q) = depth_queues.get(event.queue()) {
                q.publish_depth();
            }
        }));

        info!(queues = queues.len(), backend = store.backend(), "queue manager started");
        Ok(Self {
            queues,
            pools,
            store,
            events,
            scheduler: Scheduler::new(),
            listener_token,
            listener: Mutex::new(Some(listener)),
            accepting: AtomicBool::new(true),
            shutdown_grace,
        })
    }

    /// One queue per job kind, configured from `[queues]` and `[shutdown]`.
    pub fn from_settings(
        settings: &Settings,
        handlers: HandlerRegistry,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, QueueError> {
        Self::start(
            QueueConfig::all(&settings.queues),
            handlers,
            store,
            Duration::from_millis(settings.shutdown.grace_timeout_ms),
        )
    }

    fn queue(&self, name: &str) -> Result<&Arc<Queue>, QueueError> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Enqueues a job. With `repeat` set, the first run is enqueued now and the job is
    /// re-enqueued every interval under a stable id.
    pub async fn add_job(&self, queue: &str, payload: JobPayload, options: JobOptions) -> Result<JobHandle, QueueError> {
        if !self.is_accepting() {
            metrics::increment_job_rejected("shutting_down");
            return Err(QueueError::ShuttingDown);
        }
        let q = self.queue(queue)?;
        let kind = payload.kind();
        if !q.config.accepts(kind) {
            metrics::increment_job_rejected("kind_not_routed");
            return Err(QueueError::KindNotRouted {
                queue: queue.to_string(),
                kind,
            });
        }

        let repeat_every = options
            .repeat
            .map(|r| Duration::from_millis(r.every_ms))
            .filter(|d| !d.is_zero());
        let id = match (&options.job_id, repeat_every) {
            (Some(id), _) => id.clone(),
            (None, Some(every)) => repeat_job_id(queue, &payload, every),
            (None, None) => uuid::Uuid::new_v4().to_string(),
        };
        if repeat_every.is_some() && self.scheduler.is_registered(&id) {
            return Err(QueueError::DuplicateJob {
                queue: queue.to_string(),
                id,
            });
        }

        let (job, delay) = q.build_job(payload.clone(), &options, id.clone());
        let job = q.add(job, delay).await?;

        if let Some(every) = repeat_every {
            self.scheduler.register(q.clone(), id, payload, options, every)?;
        }
        Ok(job.handle())
    }

    /// [`add_job`](Self::add_job) for callers holding a kind name and a JSON payload.
    pub async fn add_job_json(
        &self,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let kind: JobKind = kind.parse()?;
        let payload = JobPayload::from_json(kind, payload).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        self.add_job(queue, payload, options).await
    }

    /// Job from memory, falling back to its broker snapshot.
    pub async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let q = self.queue(queue)?;
        if let Some(job) = q.get(id) {
            return Ok(Some(job));
        }
        Ok(q.mirrored(id).await?)
    }

    pub fn get_children(&self, queue: &str, parent_id: &str) -> Result<Vec<Job>, QueueError> {
        Ok(self.queue(queue)?.children(parent_id))
    }

    pub fn get_queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(self.queue(queue)?.stats())
    }

    /// Stats of every queue, ordered by name.
    pub fn all_stats(&self) -> BTreeMap<String, QueueStats> {
        self.queues
            .iter()
            .map(|(name, q)| (name.clone(), q.stats()))
            .collect()
    }

    /// Stops handing out jobs; enqueues are still accepted.
    pub fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.queue(queue)?.pause();
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    pub fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.queue(queue)?.resume();
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    /// Pauses only this process's workers for the queue.
    pub fn pause_worker(&self, queue: &str) -> Result<(), QueueError> {
        self.queue(queue)?.pause_worker();
        info!(queue = %queue, "worker paused");
        Ok(())
    }

    pub fn resume_worker(&self, queue: &str) -> Result<(), QueueError> {
        self.queue(queue)?.resume_worker();
        info!(queue = %queue, "worker resumed");
        Ok(())
    }

    /// Removes waiting jobs (and delayed ones when asked); returns how many were removed.
    pub async fn drain_queue(&self, queue: &str, include_delayed: bool) -> Result<usize, QueueError> {
        let removed = self.queue(queue)?.drain(include_delayed).await;
        info!(queue = %queue, removed = removed.len(), include_delayed, "queue drained");
        Ok(removed.len())
    }

    /// Removes jobs in `status` older than `grace`; returns their ids.
    pub async fn clean_queue(&self, queue: &str, grace: Duration, status: JobState) -> Result<Vec<String>, QueueError> {
        let removed = self.queue(queue)?.clean(grace, status).await;
        info!(queue = %queue, removed = removed.len(), status = status.as_str(), "queue cleaned");
        Ok(removed)
    }

    /// Per-queue reachability: a queue is healthy while it is open and its broker
    /// writes succeed.
    pub async fn get_health(&self) -> HealthReport {
        let broker = self.store.ping().await.is_ok();
        let mut queues = BTreeMap::new();
        for (name, q) in &self.queues {
            let ok = broker && !q.is_closed() && (q.is_broker_healthy() || q.check_broker().await);
            queues.insert(name.clone(), ok);
        }
        HealthReport {
            healthy: broker && queues.values().all(|ok| *ok),
            queues,
            broker,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Stops schedulers and rejects new jobs, lets in-flight jobs finish (bounded by the
    /// grace timeout), stops the event listener, closes the queues, then closes the store.
    pub async fn graceful_shutdown(&self) -> Result<(), QueueError> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("queue manager shutting down");

        self.scheduler.stop().await;

        let grace = self.shutdown_grace;
        let drained = futures::future::join_all(self.pools.iter().map(|p| p.stop(grace))).await;
        let aborted = drained.iter().filter(|ok| !**ok).count();
        if aborted > 0 {
            warn!(pools = aborted, "worker pools aborted jobs at shutdown");
        }

        self.listener_token.cancel();
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                error!(error = %e, "event listener task failed");
            }
        }

        for q in self.queues.values() {
            q.close();
        }

        self.store.close().await?;
        info!("queue manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryStore;
    use crate::settings::QueueSettings;

    #[tokio::test]
    async fn test_start_fails_on_unhandled_kind() {
        let configs = vec![QueueConfig::for_kind(JobKind::WalletScan, &QueueSettings::default())];
        let err = QueueManager::start(configs, HandlerRegistry::new(), Arc::new(MemoryStore::new()), Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::MissingHandlers(k) if k == vec![JobKind::WalletScan]));
    }

    #[tokio::test]
    async fn test_empty_manager_is_healthy_and_shuts_down_once() {
        let manager =
            QueueManager::start(Vec::new(), HandlerRegistry::new(), Arc::new(MemoryStore::new()), Duration::from_secs(1))
                .unwrap();
        let health = manager.get_health().await;
        assert!(health.healthy && health.broker);
        assert!(matches!(
            manager.get_queue_stats("nope"),
            Err(QueueError::UnknownQueue(_))
        ));

        manager.graceful_shutdown().await.unwrap();
        manager.graceful_shutdown().await.unwrap();
        assert!(!manager.is_accepting());
        assert!(!manager.get_health().await.broker);
    }
}
