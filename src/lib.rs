//! # LP Scan Engine
//!
//! Background job queues and a tiered cache for scanning wallets for liquidity-provider
//! positions across protocols and chains.
//!
//! ## Overview
//!
//! A wallet scan fans out into one fetch per protocol; refresh and analytics jobs run on
//! their own cadences. The engine schedules, retries and caches that work so partial
//! failures are reported rather than lost and stale data is served only within bounds.
//!
//! ## Architecture
//!
//! ### Cache Layer
//! A [`CacheStore`](cache_store::CacheStore) (in-memory or Redis) wrapped by the
//! [`CacheLayer`](cache_layer::CacheLayer): named strategies (`FAST_ACCESS`, `READ_HEAVY`,
//! `PERSISTENT`), stale-while-revalidate and pattern invalidation. The
//! [`InvalidationManager`](invalidation::InvalidationManager) turns domain events into
//! cascading evictions.
//!
//! ### Jobs & Processors
//! Typed payload/result contracts per [`JobKind`](jobs::JobKind) and one handler per job
//! family (scan, refresh, analytics).
//!
//! ### Queue Manager
//! One queue and worker pool per job kind, with retries, stalled-job recovery, repeat
//! schedules, lifecycle events, health checks and ordered shutdown.

// Storage
/// Clock abstraction for TTL math
pub mod clock;
/// Key-value store backends (memory, Redis)
pub mod cache_store;
/// Cache key namespaces
pub mod cache_keys;
/// Strategy-aware typed cache with stale-while-revalidate
pub mod cache_layer;
/// Domain-event driven cache invalidation
pub mod invalidation;

// Domain
/// Position and market data types
pub mod types;
/// Pure analytics over wallet scans
pub mod analytics;
/// Position and market data source capabilities
pub mod position_source;
/// Source implementations (JSON fixtures)
pub mod adapters;

// Jobs
/// Job kinds, payloads, results and options
pub mod jobs;
/// Job handlers per family
pub mod processors;
/// Named queues, workers and the queue manager
pub mod queue;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

pub use cache_layer::{CacheLayer, CacheStrategy};
pub use invalidation::InvalidationManager;
pub use jobs::{JobKind, JobOptions, JobPayload};
pub use queue::QueueManager;
pub use settings::Settings;
