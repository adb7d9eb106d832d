use conduit_core::{ConduitError, ConduitResult};
use conduit_resilience::{Scheduler, SchedulerConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("conduit_resilience=debug".parse().unwrap()))
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::test]
async fn test_never_exceeds_concurrency() {
    init_test_tracing();
    let scheduler = Scheduler::new(SchedulerConfig { concurrency: 3 });
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tickets: Vec<_> = (0..12)
        .map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            scheduler.enqueue(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(i))
                },
                (i % 4) as i32,
                format!("task-{}", i),
            )
        })
        .collect();

    for ticket in tickets {
        ticket.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    let stats = scheduler.stats();
    assert_eq!(stats.dispatched, 12);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_lower_priority_number_dispatches_first_when_slot_frees() {
    init_test_tracing();
    let scheduler = Scheduler::new(SchedulerConfig { concurrency: 2 });
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy both slots
    let blockers: Vec<_> = (0..2)
        .map(|i| {
            let gate = gate.clone();
            scheduler.enqueue(
                async move {
                    gate.notified().await;
                    Ok(json!(i))
                },
                1,
                format!("blocker-{}", i),
            )
        })
        .collect();

    let record = |label: &'static str| {
        let order = order.clone();
        async move {
            order.lock().await.push(label);
            Ok::<Value, ConduitError>(json!(label))
        }
    };

    let news = scheduler.enqueue(record("news"), 5, "AAPL:news");
    let factors = scheduler.enqueue(record("factors"), 4, "AAPL:factors");
    let price = scheduler.enqueue(record("price"), 1, "AAPL:price");

    assert_eq!(scheduler.stats().queued_keys, vec!["AAPL:price", "AAPL:factors", "AAPL:news"]);

    // Free exactly one slot
    gate.notify_one();
    let mut blockers = blockers.into_iter();
    let first = blockers.next().unwrap();
    let second = blockers.next().unwrap();
    let freed = tokio::select! {
        r = first => r,
        r = second => r,
    };
    freed.unwrap();
    price.await.unwrap();

    assert_eq!(order.lock().await.first().copied(), Some("price"));

    gate.notify_waiters();
    gate.notify_one();
    factors.await.unwrap();
    news.await.unwrap();

    assert_eq!(*order.lock().await, vec!["price", "factors", "news"]);
}

#[tokio::test]
async fn test_failures_propagate_unchanged() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let result: ConduitResult<Value> = scheduler
        .enqueue(async { Err(ConduitError::Validation("empty symbol".to_string())) }, 2, "x")
        .await;
    assert_eq!(result, Err(ConduitError::Validation("empty symbol".to_string())));
}
