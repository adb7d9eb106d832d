//!
//! Conduit - resilient data access
//!
//! Facade over the workspace crates: the orchestrator and its cache, the
//! resilience primitives it composes, and the monitoring setup.

pub use conduit_core::{
    CacheKey, ConduitError, ConduitResult, DataKind, FailureClass, Fetcher, Payload, WriteOutcome,
    WriteRequest,
};
pub use conduit_monitoring::{
    MetricsCollector, MetricsConfig, MetricsSnapshot, MonitoringConfig,
};
pub use conduit_orchestrator::{
    CacheSettings, CacheStats, Components, ConduitConfig, DataCache, DataEvent, EventBus,
    HttpFetcher, Orchestrator, OrchestratorStats,
};
pub use conduit_resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, FileStateStore,
    InMemoryStateStore, OfflineQueue, OfflineQueueConfig, ReplayReport, Scheduler,
    SchedulerConfig, StateStore,
};

/// Monitoring setup and exposition
pub mod monitoring {
    pub use conduit_monitoring::{init, logging, render_prometheus, shutdown};
}
