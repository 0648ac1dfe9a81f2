//! # Job Processors
//!
//! One handler per job family. The queue manager looks handlers up by [`JobKind`]
//! through a [`HandlerRegistry`] validated at startup, so a kind without a handler
//! fails when the manager starts rather than when its first job runs.
//!
//! - [`scan::ScanProcessor`]: wallet, protocol, quick and bulk scans
//! - [`refresh::RefreshProcessor`]: price/TVL/position refresh, cache warmup, stale data cleanup
//! - [`analytics::AnalyticsProcessor`]: portfolio, protocol, yield, risk and historical analytics
//!
//! Handlers read and write through the [`CacheLayer`] only and reach the outside world
//! through the [`SourceRegistry`].

pub mod analytics;
pub mod refresh;
pub mod scan;

use crate::cache_layer::CacheLayer;
use crate::invalidation::InvalidationManager;
use crate::jobs::{JobError, JobKind, JobOutput, JobPayload};
use crate::position_source::SourceRegistry;
use crate::settings::{ProcessorSettings, WarmupSettings};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use analytics::AnalyticsProcessor;
pub use refresh::RefreshProcessor;
pub use scan::ScanProcessor;

/// Receives progress updates of a running job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, job_id: &str, progress: u8);
}

/// Per-attempt context handed to a handler.
pub struct JobContext {
    pub job_id: String,
    pub queue: String,
    pub kind: JobKind,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    progress: AtomicU8,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, queue: impl Into<String>, kind: JobKind, attempt: u32, max_attempts: u32) -> Self {
        Self {
            job_id: job_id.into(),
            queue: queue.into(),
            kind,
            attempt,
            max_attempts,
            progress: AtomicU8::new(0),
            sink: None,
        }
    }

    /// Context for running a handler outside any queue.
    pub fn detached(kind: JobKind) -> Self {
        Self::new("inline", kind.default_queue(), kind, 1, 1)
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Records progress (clamped to 100) and forwards it to the sink.
    pub fn progress(&self, pct: u8) {
        let pct = pct.min(100);
        self.progress.store(pct, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.report(&self.job_id, pct);
        }
    }

    pub fn current_progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Kinds this handler processes.
    fn kinds(&self) -> &'static [JobKind];

    async fn handle(&self, ctx: &JobContext, payload: JobPayload) -> Result<JobOutput, JobError>;
}

/// `JobKind -> handler` routing table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every kind it declares, replacing earlier registrations.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, handler.clone());
        }
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Kinds from `required` that have no handler.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a JobKind>) -> Vec<JobKind> {
        let mut missing: Vec<JobKind> = required.into_iter().filter(|k| !self.contains(**k)).copied().collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Collaborators shared by every processor family.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub cache: Arc<CacheLayer>,
    pub invalidation: Arc<InvalidationManager>,
    pub sources: SourceRegistry,
    pub settings: ProcessorSettings,
    pub warmup: WarmupSettings,
}

impl ProcessorDeps {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.fetch_timeout_ms)
    }
}

/// Registry with all three families wired to `deps`.
pub fn default_registry(deps: Arc<ProcessorDeps>) -> HandlerRegistry {
    let scan = Arc::new(ScanProcessor::new(deps.clone()));
    let mut registry = HandlerRegistry::new();
    registry
        .register(scan.clone())
        .register(Arc::new(RefreshProcessor::new(deps.clone(), scan)))
        .register(Arc::new(AnalyticsProcessor::new(deps)));
    registry
}

/// Bounds an external call; elapsing the deadline is an error like any other fetch failure.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {}ms", timeout.as_millis())),
    }
}

pub(crate) fn elapsed_ms(started: std::time::Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Rejects a payload routed to the wrong handler.
pub(crate) fn unexpected(kind: JobKind, handler: &str) -> JobError {
    JobError::InvalidPayload(format!("{} payload routed to {} processor", kind, handler))
}
