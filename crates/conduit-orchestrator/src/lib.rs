//!
//! Conduit orchestrator: the load and write entry points of the data layer.
//!
//! Composes the cache, breaker registry, scheduler, offline queue and
//! metrics collector behind `Orchestrator`, and owns in-flight deduplication.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// LRU/TTL cache
pub mod cache;

/// Configuration module
pub mod config;

/// Lifecycle events
pub mod events;

/// HTTP fetcher
pub mod http_fetcher;

/// Orchestrator module
pub mod orchestrator;

// Re-export key types
pub use cache::{CacheSettings, CacheStats, DataCache};
pub use config::ConduitConfig;
pub use events::{DataEvent, EventBus};
pub use http_fetcher::HttpFetcher;
pub use orchestrator::{normalize, Components, Orchestrator, OrchestratorStats, WRITE_RESOURCE};
