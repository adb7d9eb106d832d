//! Resilience patterns for the Conduit data layer
//!
//! This crate provides the per-resource circuit breaker registry, the
//! priority scheduler that bounds upstream concurrency, and the durable
//! offline queue for writes, plus the state stores they persist through.

use async_trait::async_trait;
use conduit_core::ConduitResult;
use serde_json::Value;

pub mod adapters;
pub mod circuit_breaker;
pub mod offline_queue;
pub mod scheduler;

// Re-export common components
pub use adapters::{FileStateStore, InMemoryStateStore};
pub use circuit_breaker::{
    BreakerSnapshot, BreakerTransition, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use offline_queue::{OfflineItem, OfflineQueue, OfflineQueueConfig, OfflineStats, ReplayReport};
pub use scheduler::{QueueItem, Scheduler, SchedulerConfig, SchedulerStats, Ticket};

/// Minimal key/value interface for durable state
///
/// Resilience components persist their state as JSON documents under
/// well-known keys; anything that can store those survives a restart.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the document stored under `key`
    async fn get_state(&self, key: &str) -> ConduitResult<Option<Value>>;

    /// Replace the document stored under `key`
    async fn set_state(&self, key: &str, state: Value) -> ConduitResult<()>;

    /// Remove the document stored under `key`, if any
    async fn delete_state(&self, key: &str) -> ConduitResult<()>;
}
