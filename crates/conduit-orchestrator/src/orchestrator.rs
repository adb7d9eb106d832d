//! Load and write entry points
//!
//! Reads go cache → in-flight table → scheduler → breaker → fetcher. Each
//! collaborator is owned here and knows nothing of the others; the only
//! cross-wiring is the breaker transition hook feeding metrics.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use conduit_core::{
    CacheKey, ConduitError, ConduitResult, DataKind, FailureClass, Fetcher, Payload, WriteOutcome,
    WriteRequest,
};
use conduit_monitoring::{MetricsCollector, MetricsSnapshot};
use conduit_resilience::{
    BreakerSnapshot, BreakerTransition, CircuitBreakerRegistry, OfflineQueue, OfflineStats,
    ReplayReport, Scheduler, SchedulerStats, StateStore,
};

use crate::cache::{CacheStats, DataCache};
use crate::config::ConduitConfig;
use crate::events::{DataEvent, EventBus};

/// Breaker resource key for the write path
pub const WRITE_RESOURCE: &str = "write";

type SharedLoad = Shared<BoxFuture<'static, ConduitResult<Payload>>>;

/// Collaborators the orchestrator is assembled from
pub struct Components {
    /// Payload cache
    pub cache: Arc<DataCache>,
    /// Per-resource breakers
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Bounded priority scheduler
    pub scheduler: Scheduler,
    /// Metrics collector
    pub metrics: Arc<MetricsCollector>,
    /// Durable queue of deferred writes
    pub offline: OfflineQueue,
    /// Lifecycle event channel
    pub events: EventBus,
}

impl Components {
    /// Build every collaborator from configuration
    ///
    /// Pending offline writes persisted in `store` are restored.
    pub async fn from_config(config: &ConduitConfig, store: Arc<dyn StateStore>) -> ConduitResult<Self> {
        Ok(Self {
            cache: Arc::new(DataCache::new(config.cache.clone())),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            scheduler: Scheduler::new(config.scheduler.clone()),
            metrics: Arc::new(MetricsCollector::new(config.metrics.clone())),
            offline: OfflineQueue::load(config.offline_queue.clone(), store).await?,
            events: EventBus::default(),
        })
    }
}

/// Observability snapshot across every component
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    /// Cache statistics
    pub cache: CacheStats,
    /// Breakers by resource key
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    /// Scheduler statistics
    pub scheduler: SchedulerStats,
    /// Offline queue statistics
    pub offline: OfflineStats,
    /// Metrics snapshot
    pub metrics: MetricsSnapshot,
    /// Loads currently in flight
    pub in_flight: usize,
    /// Connectivity flag
    pub online: bool,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<DataCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    scheduler: Scheduler,
    metrics: Arc<MetricsCollector>,
    offline: OfflineQueue,
    events: EventBus,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
    online: AtomicBool,
}

/// Resilient data-access facade
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Assemble an orchestrator; it starts online
    pub fn new(fetcher: Arc<dyn Fetcher>, components: Components) -> Self {
        let Components {
            cache,
            breakers,
            scheduler,
            metrics,
            offline,
            events,
        } = components;

        let observer = metrics.clone();
        breakers.set_transition_hook(Arc::new(move |transition: &BreakerTransition| {
            observer.record_circuit_state(transition.to);
        }));

        Self {
            inner: Arc::new(Inner {
                fetcher,
                cache,
                breakers,
                scheduler,
                metrics,
                offline,
                events,
                in_flight: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Build the components from configuration and assemble
    pub async fn from_config(
        config: &ConduitConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn StateStore>,
    ) -> ConduitResult<Self> {
        let components = Components::from_config(config, store).await?;
        Ok(Self::new(fetcher, components))
    }

    /// Load `entity` as `kind`
    ///
    /// Served from cache when fresh. Otherwise joins an identical load in
    /// flight or schedules a new fetch at the kind's priority. Failures are
    /// returned unchanged, after metrics and an `Error` event.
    pub async fn load_data(&self, entity: &str, kind: DataKind) -> ConduitResult<Payload> {
        if entity.trim().is_empty() {
            let error = ConduitError::Validation("entity key must not be empty".to_string());
            self.inner.metrics.record_error(&error.histogram_label());
            self.inner.events.publish(DataEvent::Error {
                entity: entity.to_string(),
                kind,
                error: error.clone(),
            });
            return Err(error);
        }

        let key = CacheKey::new(entity, &kind);

        if let Some(value) = self.inner.cache.get(key.as_str()) {
            self.inner.metrics.record_cache(true);
            self.inner.events.publish(DataEvent::Loaded {
                entity: entity.to_string(),
                kind,
                cached: true,
            });
            return Ok(value);
        }
        self.inner.metrics.record_cache(false);

        let load = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(key.as_str()) {
                Some(existing) => {
                    debug!("Joining in-flight load of {}", key);
                    existing.clone()
                }
                None => {
                    let load = self.schedule(entity, kind, key.clone());
                    in_flight.insert(key.as_str().to_string(), load.clone());
                    // Drive the load to completion even if every caller goes away
                    tokio::spawn(load.clone());
                    load
                }
            }
        };

        load.await
    }

    /// Queue the fetch for `key` and wrap it with cleanup and events
    fn schedule(&self, entity: &str, kind: DataKind, key: CacheKey) -> SharedLoad {
        self.inner.events.publish(DataEvent::Loading {
            entity: entity.to_string(),
            kind: kind.clone(),
        });

        let task = {
            let inner = self.inner.clone();
            let entity = entity.to_string();
            let kind = kind.clone();
            let key = key.clone();
            async move { inner.fetch_and_store(&entity, &kind, &key).await }
        };
        let ticket = self.inner.scheduler.enqueue(task, kind.priority(), key.as_str());

        let inner = self.inner.clone();
        let entity = entity.to_string();
        async move {
            let result = ticket.await;
            inner.in_flight.lock().remove(key.as_str());

            let event = match &result {
                Ok(_) => DataEvent::Loaded {
                    entity,
                    kind,
                    cached: false,
                },
                Err(error) => DataEvent::Error {
                    entity,
                    kind,
                    error: error.clone(),
                },
            };
            inner.events.publish(event);
            result
        }
        .boxed()
        .shared()
    }

    /// Apply a write, deferring it to the offline queue when unreachable
    ///
    /// Writes already queued go first: a pending queue is replayed before
    /// the new write is sent, and the new write is queued behind anything
    /// the replay could not deliver.
    pub async fn submit_write(&self, request: WriteRequest) -> ConduitResult<WriteOutcome> {
        if request.operation.trim().is_empty() {
            return Err(ConduitError::Validation("write operation must not be empty".to_string()));
        }

        if !self.is_online() {
            debug!("Offline, deferring {} on {}", request.operation, request.target);
            return self.defer(request).await;
        }

        if !self.inner.offline.is_empty().await {
            self.process_offline_queue().await?;
            if !self.inner.offline.is_empty().await {
                debug!(
                    "Offline queue not drained, deferring {} on {} behind it",
                    request.operation, request.target
                );
                return self.defer(request).await;
            }
        }

        match self.inner.write_upstream(&request).await {
            Ok(applied) => Ok(WriteOutcome::Applied(applied)),
            Err(e) if e.is_unreachable() => {
                warn!("Write {} on {} deferred: {}", request.operation, request.target, e);
                self.defer(request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn defer(&self, request: WriteRequest) -> ConduitResult<WriteOutcome> {
        let item = self.inner.offline.enqueue(request).await?;
        self.inner.events.publish(DataEvent::WriteDeferred {
            id: item.id.clone(),
            request: item.request_descriptor,
        });
        Ok(WriteOutcome::Deferred { id: item.id })
    }

    /// Set connectivity; going online replays the offline queue
    pub async fn set_online(&self, online: bool) -> ConduitResult<Option<ReplayReport>> {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("Connectivity restored");
                self.process_offline_queue().await.map(Some)
            }
            (true, false) => {
                info!("Connectivity lost, writes will be deferred");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Connectivity flag
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Replay deferred writes in FIFO order
    pub async fn process_offline_queue(&self) -> ConduitResult<ReplayReport> {
        let inner = self.inner.clone();
        let report = self
            .inner
            .offline
            .process_queue(move |request| {
                let inner = inner.clone();
                async move { inner.write_upstream(&request).await }
            })
            .await?;

        for id in &report.replayed {
            self.inner
                .events
                .publish(DataEvent::WriteReplayed { id: id.clone() });
        }
        for item in &report.dropped {
            self.inner
                .metrics
                .record_error(&format!("offline write dropped: {}", item.request_descriptor.operation));
            self.inner.events.publish(DataEvent::WriteDropped {
                id: item.id.clone(),
                attempts: item.attempts,
                last_error: item.last_error.clone(),
            });
        }

        if !report.replayed.is_empty() || !report.dropped.is_empty() {
            info!(
                "Offline replay: {} applied, {} retained, {} dropped, {} not tried",
                report.replayed.len(),
                report.retained.len(),
                report.dropped.len(),
                report.skipped.len()
            );
        }
        Ok(report)
    }

    /// Drop the cached entry for `key`; returns whether one existed
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.cache.delete(key);
        debug!("Invalidated {} (present: {})", key, removed);
        removed
    }

    /// Drop every cached entry whose key matches the regular expression
    pub fn invalidate_pattern(&self, pattern: &str) -> ConduitResult<usize> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConduitError::Validation(format!("Invalid pattern {}: {}", pattern, e)))?;
        let removed = self.inner.cache.delete_matching(|key| regex.is_match(key));
        debug!("Invalidated {} entries matching {}", removed, pattern);
        Ok(removed)
    }

    /// Empty the cache
    pub fn clear_all(&self) {
        self.inner.cache.clear();
        info!("Cache cleared");
    }

    /// Snapshot of every component
    pub async fn get_stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cache: self.inner.cache.stats(),
            breakers: self.inner.breakers.snapshot_all(),
            scheduler: self.inner.scheduler.stats(),
            offline: self.inner.offline.stats().await,
            metrics: self.inner.metrics.get_metrics(),
            in_flight: self.inner.in_flight.lock().len(),
            online: self.is_online(),
        }
    }

    /// Receive lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.inner.events.subscribe()
    }

    /// Start the periodic cache prune
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.inner.cache.spawn_pruner(self.inner.cache.prune_interval())
    }

    /// The payload cache
    pub fn cache(&self) -> &DataCache {
        &self.inner.cache
    }

    /// The breaker registry
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    /// The metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// The offline write queue
    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.inner.offline
    }
}

impl Inner {
    async fn fetch_and_store(&self, entity: &str, kind: &DataKind, key: &CacheKey) -> ConduitResult<Payload> {
        let started = Instant::now();
        let result = self
            .breakers
            .execute(kind.as_str(), || self.fetcher.fetch(entity, kind))
            .await
            .and_then(normalize);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(value) => {
                self.cache.set(key.as_str(), value.clone(), self.cache.default_ttl());
                self.metrics.record_request(kind.as_str(), true, latency_ms);
                debug!("Loaded {} in {:.1}ms", key, latency_ms);
            }
            Err(e) => {
                self.metrics.record_request(kind.as_str(), false, latency_ms);
                self.metrics.record_error(&e.histogram_label());
                warn!("Load of {} failed: {}", key, e);
            }
        }
        result
    }

    async fn write_upstream(&self, request: &WriteRequest) -> ConduitResult<Payload> {
        let started = Instant::now();
        let result = self
            .breakers
            .execute(WRITE_RESOURCE, || self.fetcher.write(request))
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.metrics.record_request(WRITE_RESOURCE, result.is_ok(), latency_ms);
        if let Err(e) = &result {
            self.metrics.record_error(&e.histogram_label());
        }
        result
    }
}

/// Unwrap a top-level `data` envelope and reject empty payloads
pub fn normalize(payload: Payload) -> ConduitResult<Payload> {
    let unwrapped = match payload {
        Value::Object(mut fields) if fields.contains_key("data") => {
            fields.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    if unwrapped.is_null() {
        return Err(ConduitError::upstream_with_class(
            FailureClass::Application,
            "upstream returned an empty payload",
        ));
    }
    Ok(unwrapped)
}
