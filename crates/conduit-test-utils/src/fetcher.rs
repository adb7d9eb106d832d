//! Scriptable in-memory implementation of the Fetcher trait.

use async_trait::async_trait;
use conduit_core::{ConduitResult, DataKind, Fetcher, Payload, WriteRequest};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Thread-safe fake fetcher for testing.
///
/// Reads return scripted results keyed by `<entity>:<kind>` in order, then
/// any standing result for the kind, then a generated payload. Writes
/// behave the same way keyed by operation.
#[derive(Clone, Default)]
pub struct MockFetcher {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    scripted: Mutex<HashMap<String, VecDeque<ConduitResult<Payload>>>>,
    standing: Mutex<HashMap<String, ConduitResult<Payload>>>,
    write_scripted: Mutex<VecDeque<ConduitResult<Payload>>>,
    fetch_log: Mutex<Vec<String>>,
    write_log: Mutex<Vec<WriteRequest>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl fmt::Debug for MockFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFetcher")
            .field("fetch_calls", &self.fetch_calls())
            .field("write_calls", &self.write_calls())
            .finish()
    }
}

impl MockFetcher {
    /// Creates a fetcher that answers every read with a generated payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock() = Some(delay);
        self
    }

    /// Queues a one-off result for `<entity>:<kind>`.
    pub fn push_fetch_result(&self, key: &str, result: ConduitResult<Payload>) {
        self.inner
            .scripted
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(result);
    }

    /// Answers every read of `kind` with `result` until cleared.
    pub fn set_kind_result(&self, kind: &DataKind, result: ConduitResult<Payload>) {
        self.inner.standing.lock().insert(kind.to_string(), result);
    }

    /// Removes the standing result for `kind`.
    pub fn clear_kind_result(&self, kind: &DataKind) {
        self.inner.standing.lock().remove(kind.as_str());
    }

    /// Queues a one-off result for the next write.
    pub fn push_write_result(&self, result: ConduitResult<Payload>) {
        self.inner.write_scripted.lock().push_back(result);
    }

    /// Makes every call wait until released; returns the release handle.
    ///
    /// Each permit added to the returned semaphore lets one call finish.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.inner.gate.lock() = Some(gate.clone());
        gate
    }

    /// Total read calls.
    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_log.lock().len()
    }

    /// Read calls for `<entity>:<kind>`.
    pub fn fetch_calls_for(&self, key: &str) -> usize {
        self.inner.fetch_log.lock().iter().filter(|k| *k == key).count()
    }

    /// Keys read so far, in call order.
    pub fn fetch_log(&self) -> Vec<String> {
        self.inner.fetch_log.lock().clone()
    }

    /// Total write calls.
    pub fn write_calls(&self) -> usize {
        self.inner.write_log.lock().len()
    }

    /// Writes received so far, in call order.
    pub fn written(&self) -> Vec<WriteRequest> {
        self.inner.write_log.lock().clone()
    }

    async fn pace(&self) {
        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let gate = self.inner.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, entity: &str, kind: &DataKind) -> ConduitResult<Payload> {
        let key = format!("{}:{}", entity, kind);
        self.inner.fetch_log.lock().push(key.clone());
        self.pace().await;

        let scripted = self
            .inner
            .scripted
            .lock()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = scripted {
            return result;
        }

        if let Some(result) = self.inner.standing.lock().get(kind.as_str()) {
            return result.clone();
        }

        Ok(json!({ "entity": entity, "kind": kind.as_str(), "value": 100 }))
    }

    async fn write(&self, request: &WriteRequest) -> ConduitResult<Payload> {
        self.inner.write_log.lock().push(request.clone());
        self.pace().await;

        let scripted = self.inner.write_scripted.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "applied": request.operation, "target": request.target })))
    }
}
