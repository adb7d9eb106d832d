//! Durable offline write queue
//!
//! Deferred writes persist as one ordered list under a single state-store
//! key. Replay is FIFO and stops at the first item the upstream could not
//! be reached for, so later writes never overtake earlier ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use conduit_core::{ConduitError, ConduitResult, Payload, WriteRequest};

use super::StateStore;

/// Configuration for the offline queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// Storage key the queue is persisted under
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// Failed replays after which an item is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_storage_key() -> String {
    "conduit:offline-queue".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// A write waiting for connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineItem {
    /// Unique identifier for the item
    pub id: String,
    /// The write to replay
    pub request_descriptor: WriteRequest,
    /// When the write was deferred
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
    /// Message of the most recent failed replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OfflineItem {
    fn new(request: WriteRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_descriptor: request,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Ids of items applied and removed
    pub replayed: Vec<String>,
    /// Ids of items that failed and stay queued
    pub retained: Vec<String>,
    /// Items removed after exhausting their attempts
    pub dropped: Vec<OfflineItem>,
    /// Ids not tried because the pass stopped at an unreachable upstream
    pub skipped: Vec<String>,
}

/// Offline queue statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineStats {
    /// Storage key the queue is persisted under
    pub storage_key: String,
    /// Items waiting for replay
    pub pending: usize,
    /// Items replayed successfully since creation
    pub replayed_total: u64,
    /// Items dropped since creation
    pub dropped_total: u64,
}

struct OfflineState {
    items: VecDeque<OfflineItem>,
    replayed_total: u64,
    dropped_total: u64,
}

/// Durable FIFO of deferred writes
#[derive(Clone)]
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    state: Arc<Mutex<OfflineState>>,
    /// Serializes replay passes
    replay_lock: Arc<Mutex<()>>,
    state_store: Arc<dyn StateStore>,
}

impl OfflineQueue {
    /// Open the queue, restoring any items persisted by a previous process
    pub async fn load(config: OfflineQueueConfig, state_store: Arc<dyn StateStore>) -> ConduitResult<Self> {
        let mut items = VecDeque::new();

        match state_store.get_state(&config.storage_key).await? {
            Some(Value::Array(stored)) => {
                for value in stored {
                    match serde_json::from_value::<OfflineItem>(value) {
                        Ok(item) => items.push_back(item),
                        Err(e) => warn!("Skipping unreadable offline item in {}: {}", config.storage_key, e),
                    }
                }
            }
            Some(other) => warn!(
                "Ignoring offline queue state in {}: expected a list, found {}",
                config.storage_key, other
            ),
            None => {}
        }

        if !items.is_empty() {
            info!("Restored {} pending offline writes from {}", items.len(), config.storage_key);
        }

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(OfflineState {
                items,
                replayed_total: 0,
                dropped_total: 0,
            })),
            replay_lock: Arc::new(Mutex::new(())),
            state_store,
        })
    }

    /// Append a write and persist the queue before returning
    pub async fn enqueue(&self, request: WriteRequest) -> ConduitResult<OfflineItem> {
        let item = OfflineItem::new(request);
        let mut state = self.state.lock().await;
        state.items.push_back(item.clone());

        if let Err(e) = self.persist(&state.items).await {
            state.items.pop_back();
            error!("Failed to persist offline write {}: {}", item.id, e);
            return Err(e);
        }

        debug!(
            "Deferred {} on {} as {} ({} pending)",
            item.request_descriptor.operation,
            item.request_descriptor.target,
            item.id,
            state.items.len()
        );
        Ok(item)
    }

    /// Replay pending items in FIFO order, one at a time
    ///
    /// A failed item stays queued with its attempt count raised and is
    /// dropped once it reaches the configured maximum. An unreachable
    /// upstream ends the pass and leaves the remaining items untouched; a
    /// `CircuitOpen` rejection sent nothing, so it does not count as an
    /// attempt.
    pub async fn process_queue<F, Fut>(&self, mut replay: F) -> ConduitResult<ReplayReport>
    where
        F: FnMut(WriteRequest) -> Fut,
        Fut: Future<Output = ConduitResult<Payload>>,
    {
        let _pass = self.replay_lock.lock().await;
        let pending: Vec<OfflineItem> = self.state.lock().await.items.iter().cloned().collect();
        let mut report = ReplayReport::default();

        if pending.is_empty() {
            return Ok(report);
        }
        info!("Replaying {} offline writes", pending.len());

        let mut remaining = pending.into_iter();
        while let Some(item) = remaining.next() {
            let outcome = replay(item.request_descriptor.clone()).await;

            if let Err(e @ ConduitError::CircuitOpen { .. }) = &outcome {
                debug!("Replay halted at {}: {}", item.id, e);
                report.skipped.push(item.id);
                report.skipped.extend(remaining.map(|rest| rest.id));
                break;
            }

            let mut state = self.state.lock().await;
            let Some(position) = state.items.iter().position(|queued| queued.id == item.id) else {
                continue;
            };

            let halt = match outcome {
                Ok(_) => {
                    state.items.remove(position);
                    state.replayed_total += 1;
                    debug!("Replayed offline write {}", item.id);
                    report.replayed.push(item.id);
                    false
                }
                Err(e) => {
                    let attempts = {
                        let queued = &mut state.items[position];
                        queued.attempts += 1;
                        queued.last_error = Some(e.to_string());
                        queued.attempts
                    };

                    if attempts >= self.config.max_attempts {
                        if let Some(dropped) = state.items.remove(position) {
                            warn!(
                                "Dropping offline write {} after {} attempts: {}",
                                dropped.id, attempts, e
                            );
                            state.dropped_total += 1;
                            report.dropped.push(dropped);
                        }
                    } else {
                        debug!("Offline write {} failed attempt {}: {}", item.id, attempts, e);
                        report.retained.push(item.id);
                    }
                    e.is_unreachable()
                }
            };

            self.persist(&state.items).await?;

            if halt {
                report.skipped.extend(remaining.map(|rest| rest.id));
                if !report.skipped.is_empty() {
                    debug!(
                        "Upstream unreachable, {} offline writes left for the next pass",
                        report.skipped.len()
                    );
                }
                break;
            }
        }

        Ok(report)
    }

    /// Items waiting for replay, oldest first
    pub async fn items(&self) -> Vec<OfflineItem> {
        self.state.lock().await.items.iter().cloned().collect()
    }

    /// Number of items waiting for replay
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Whether nothing is waiting for replay
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current statistics
    pub async fn stats(&self) -> OfflineStats {
        let state = self.state.lock().await;
        OfflineStats {
            storage_key: self.config.storage_key.clone(),
            pending: state.items.len(),
            replayed_total: state.replayed_total,
            dropped_total: state.dropped_total,
        }
    }

    async fn persist(&self, items: &VecDeque<OfflineItem>) -> ConduitResult<()> {
        let document = serde_json::to_value(items)?;
        self.state_store
            .set_state(&self.config.storage_key, document)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStateStore;
    use serde_json::json;

    async fn queue_with_store() -> (OfflineQueue, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let queue = OfflineQueue::load(OfflineQueueConfig::default(), store.clone())
            .await
            .unwrap();
        (queue, store)
    }

    #[tokio::test]
    async fn test_enqueue_persists_ordered_list() {
        let (queue, store) = queue_with_store().await;
        queue.enqueue(WriteRequest::new("watchlist.add", "AAPL", json!({}))).await.unwrap();
        queue.enqueue(WriteRequest::new("watchlist.remove", "TSLA", json!({}))).await.unwrap();

        let stored = store.get_state("conduit:offline-queue").await.unwrap().unwrap();
        let list = stored.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["requestDescriptor"]["target"], "AAPL");
        assert_eq!(list[1]["requestDescriptor"]["target"], "TSLA");
        assert_eq!(list[0]["attempts"], 0);
        assert!(list[0]["enqueuedAt"].is_string());
        assert!(list[0].get("lastError").is_none());
    }

    #[tokio::test]
    async fn test_success_removes_and_failure_retains() {
        let (queue, _store) = queue_with_store().await;
        queue.enqueue(WriteRequest::new("watchlist.add", "AAPL", json!({}))).await.unwrap();
        queue.enqueue(WriteRequest::new("watchlist.add", "BAD", json!({}))).await.unwrap();

        let report = queue
            .process_queue(|request| async move {
                if request.target == "BAD" {
                    Err(ConduitError::upstream("connection refused"))
                } else {
                    Ok(json!({"ok": true}))
                }
            })
            .await
            .unwrap();

        assert_eq!(report.replayed.len(), 1);
        assert_eq!(report.retained.len(), 1);
        let remaining = queue.items().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 1);
        assert!(remaining[0].last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_empty_pass_is_noop() {
        let (queue, store) = queue_with_store().await;
        let report = queue.process_queue(|_| async { Ok(json!(null)) }).await.unwrap();
        assert_eq!(report, ReplayReport::default());
        assert!(store.get_state("conduit:offline-queue").await.unwrap().is_none());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_list_state_is_ignored() {
        let store = Arc::new(InMemoryStateStore::new());
        store.set_state("conduit:offline-queue", json!({"items": []})).await.unwrap();
        let queue = OfflineQueue::load(OfflineQueueConfig::default(), store).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_circuit_costs_no_attempt() {
        let (queue, _store) = queue_with_store().await;
        queue.enqueue(WriteRequest::new("watchlist.add", "AAPL", json!({}))).await.unwrap();
        queue.enqueue(WriteRequest::new("watchlist.add", "MSFT", json!({}))).await.unwrap();

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let report = queue
            .process_queue(|_| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err(ConduitError::CircuitOpen {
                        resource: "write".to_string(),
                        failures: 5,
                        retry_after_ms: 1000,
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.into_inner(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.retained.is_empty());
        assert!(queue.items().await.iter().all(|item| item.attempts == 0));
    }
}
