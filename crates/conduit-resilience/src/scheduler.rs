//!
//! Priority request scheduler
//! Bounds how many upstream calls run at once and admits queued work by
//! priority, lowest number first, FIFO among equals
//!

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use conduit_core::{ConduitError, ConduitResult, Payload};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Configured concurrency bound
    pub concurrency: usize,
    /// Tasks currently running
    pub active: usize,
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Tasks dispatched since creation
    pub dispatched: u64,
    /// Tasks settled since creation
    pub completed: u64,
    /// Dedup keys of waiting tasks, in dispatch order
    pub queued_keys: Vec<String>,
}

/// A unit of work waiting for a slot
pub struct QueueItem {
    priority: i32,
    dedup_key: String,
    enqueued_at: Instant,
    task: BoxFuture<'static, ConduitResult<Payload>>,
    responder: oneshot::Sender<ConduitResult<Payload>>,
}

impl QueueItem {
    /// Priority of the item; lower dispatches first
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Key the orchestrator deduplicates on
    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    /// Run the task and deliver its result to the waiting caller
    async fn run(self) {
        let QueueItem {
            dedup_key,
            enqueued_at,
            task,
            responder,
            ..
        } = self;

        trace!("Dispatching {} after {:?} in queue", dedup_key, enqueued_at.elapsed());

        let result = AssertUnwindSafe(task).catch_unwind().await.unwrap_or_else(|_| {
            error!("Scheduled task {} panicked", dedup_key);
            Err(ConduitError::Scheduler(format!("task {} panicked", dedup_key)))
        });

        if responder.send(result).is_err() {
            debug!("Caller for {} went away, result discarded", dedup_key);
        }
    }
}

/// Handle to the result of an enqueued task
pub struct Ticket {
    rx: oneshot::Receiver<ConduitResult<Payload>>,
}

impl Future for Ticket {
    type Output = ConduitResult<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ConduitError::Scheduler(
                    "task dropped before completion".to_string(),
                ))
            })
        })
    }
}

struct SchedulerState {
    queue: VecDeque<QueueItem>,
    active: usize,
    dispatched: u64,
    completed: u64,
}

impl SchedulerState {
    /// Stable insert: before the first item with a strictly greater priority
    fn insert(&mut self, item: QueueItem) {
        let position = self
            .queue
            .iter()
            .position(|queued| queued.priority > item.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, item);
    }
}

struct SchedulerInner {
    concurrency: usize,
    state: Mutex<SchedulerState>,
}

/// Bounded worker pool with priority-ordered admission
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler; a concurrency of zero is treated as one
    pub fn new(config: SchedulerConfig) -> Self {
        debug!("Creating scheduler with concurrency {}", config.concurrency);
        Self {
            inner: Arc::new(SchedulerInner {
                concurrency: config.concurrency.max(1),
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    active: 0,
                    dispatched: 0,
                    completed: 0,
                }),
            }),
        }
    }

    /// Queue `task` at `priority` and start it as soon as a slot is free
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<Fut>(&self, task: Fut, priority: i32, dedup_key: impl Into<String>) -> Ticket
    where
        Fut: Future<Output = ConduitResult<Payload>> + Send + 'static,
    {
        let (responder, rx) = oneshot::channel();
        let item = QueueItem {
            priority,
            dedup_key: dedup_key.into(),
            enqueued_at: Instant::now(),
            task: task.boxed(),
            responder,
        };

        {
            let mut state = self.inner.state.lock();
            trace!(
                "Enqueued {} at priority {} ({} waiting)",
                item.dedup_key,
                priority,
                state.queue.len()
            );
            state.insert(item);
        }

        Self::process(&self.inner);
        Ticket { rx }
    }

    /// Start queued items while capacity remains
    fn process(inner: &Arc<SchedulerInner>) {
        loop {
            let item = {
                let mut state = inner.state.lock();
                if state.active >= inner.concurrency {
                    break;
                }
                let Some(item) = state.queue.pop_front() else {
                    break;
                };
                state.active += 1;
                state.dispatched += 1;
                item
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                item.run().await;
                Self::release(&inner);
            });
        }
    }

    /// Free a slot and immediately pull the next eligible item
    fn release(inner: &Arc<SchedulerInner>) {
        {
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.completed += 1;
        }
        Self::process(inner);
    }

    /// Current statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            concurrency: self.inner.concurrency,
            active: state.active,
            queued: state.queue.len(),
            dispatched: state.dispatched,
            completed: state.completed,
            queued_keys: state.queue.iter().map(|item| item.dedup_key.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Notify;

    #[test]
    fn test_stable_insert_keeps_fifo_among_equals() {
        let mut state = SchedulerState {
            queue: VecDeque::new(),
            active: 0,
            dispatched: 0,
            completed: 0,
        };

        for (priority, key) in [(3, "a"), (1, "b"), (3, "c"), (1, "d"), (2, "e")] {
            let (responder, _rx) = oneshot::channel();
            state.insert(QueueItem {
                priority,
                dedup_key: key.to_string(),
                enqueued_at: Instant::now(),
                task: async { Ok(json!(null)) }.boxed(),
                responder,
            });
        }

        let order: Vec<&str> = state.queue.iter().map(|item| item.dedup_key()).collect();
        assert_eq!(order, vec!["b", "d", "e", "a", "c"]);
    }

    #[tokio::test]
    async fn test_result_and_error_reach_caller() {
        let scheduler = Scheduler::new(SchedulerConfig::default());

        let ok = scheduler.enqueue(async { Ok(json!({"px": 1})) }, 1, "AAPL:price");
        let err = scheduler.enqueue(async { Err(ConduitError::upstream("timeout")) }, 1, "AAPL:news");

        assert_eq!(ok.await.unwrap(), json!({"px": 1}));
        assert_eq!(err.await, Err(ConduitError::upstream("timeout")));
    }

    #[tokio::test]
    async fn test_ticket_pending_until_task_settles() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let (release, released) = oneshot::channel::<()>();

        let mut ticket = tokio_test::task::spawn(scheduler.enqueue(
            async move {
                let _ = released.await;
                Ok(json!("settled"))
            },
            2,
            "MSFT:metrics",
        ));
        tokio::task::yield_now().await;
        tokio_test::assert_pending!(ticket.poll());

        release.send(()).unwrap();
        while !ticket.is_woken() {
            tokio::task::yield_now().await;
        }
        assert_eq!(tokio_test::assert_ready!(ticket.poll()).unwrap(), json!("settled"));
    }

    #[tokio::test]
    async fn test_panicking_task_releases_its_slot() {
        let scheduler = Scheduler::new(SchedulerConfig { concurrency: 1 });

        let boom = scheduler.enqueue(
            async {
                if true {
                    panic!("fetcher blew up");
                }
                Ok(json!(null))
            },
            1,
            "X:price",
        );
        let next = scheduler.enqueue(async { Ok(json!(2)) }, 1, "Y:price");

        assert!(matches!(boom.await, Err(ConduitError::Scheduler(_))));
        assert_eq!(next.await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_stats_report_queued_work() {
        let scheduler = Scheduler::new(SchedulerConfig { concurrency: 1 });
        let gate = Arc::new(Notify::new());

        let blocker = {
            let gate = gate.clone();
            scheduler.enqueue(
                async move {
                    gate.notified().await;
                    Ok(json!("done"))
                },
                5,
                "blocker",
            )
        };
        let low = scheduler.enqueue(async { Ok(json!("low")) }, 4, "low");
        let high = scheduler.enqueue(async { Ok(json!("high")) }, 1, "high");

        let stats = scheduler.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.queued_keys, vec!["high".to_string(), "low".to_string()]);

        gate.notify_one();
        blocker.await.unwrap();
        high.await.unwrap();
        low.await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.queued, 0);
    }
}
