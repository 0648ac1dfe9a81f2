//! # Queue Manager
//!
//! One named queue per job kind, each served by its own worker pool, so queues are
//! independent failure domains: pausing, draining or losing the broker on one never
//! blocks another.
//!
//! ## Job lifecycle
//!
//! ```text
//! add_job ──> waiting ──> active ──> completed
//!    │           ▲          │
//!    └─ delay ─> delayed <──┤ retryable error, attempts left (backoff)
//!                           └──> failed
//! ```
//!
//! - Higher `priority` runs first, FIFO among equals.
//! - Every attempt runs under the job's execution budget; running over it is a
//!   retryable timeout.
//! - Workers renew a heartbeat while a job runs. Active jobs whose heartbeat goes quiet
//!   are re-queued as stalled under a new lease, so a late result from the stale attempt
//!   is discarded. Handlers must therefore be idempotent.
//! - Every transition is mirrored to the cache store under `queue:<queue>:job:<id>`.
//!   A failed broker write marks the queue unhealthy and its workers stop dequeuing until
//!   a ping succeeds.
//!
//! Shutdown order: schedulers and enqueues, then workers (in-flight jobs finish within
//! the grace timeout), then the event listener, the queues and finally the store.

pub mod config;
pub mod events;
mod job_queue;
pub mod manager;
pub mod refresh_hook;
pub mod sanitize;
mod scheduler;
mod state;
mod worker;

use crate::cache_store::StoreError;
use crate::jobs::{JobKind, UnknownJobKind};

pub use config::{QueueConfig, ResolvedOptions};
pub use events::QueueEvent;
pub use job_queue::QueueStats;
pub use manager::{HealthReport, QueueManager};
pub use refresh_hook::QueueRefreshHook;
pub use scheduler::repeat_job_id;

/// Contract violations and infrastructure failures of the queue manager.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("queue {queue} does not accept {kind} jobs")]
    KindNotRouted { queue: String, kind: JobKind },
    #[error("job {id} is already live in queue {queue}")]
    DuplicateJob { queue: String, id: String },
    #[error("queue manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    UnknownKind(#[from] UnknownJobKind),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("no handler registered for: {0:?}")]
    MissingHandlers(Vec<JobKind>),
    #[error("broker error: {0}")]
    Broker(#[from] StoreError),
}
