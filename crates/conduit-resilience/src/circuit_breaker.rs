//!
//! Circuit breaker registry
//! One independent breaker per resource key, so an outage behind one
//! endpoint never blocks another
//!

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use conduit_core::{ConduitError, ConduitResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    #[default]
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// Trial calls are let through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration, shared by every breaker in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open circuit waits before admitting a trial call (in milliseconds)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Read view of a single breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive breaker-relevant failures
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open
    pub consecutive_successes: u32,
}

/// A state change of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    /// Resource key of the breaker
    pub resource: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
}

/// Callback invoked on every breaker transition
pub type TransitionHook = Arc<dyn Fn(&BreakerTransition) + Send + Sync>;

/// State of one breaker
#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    /// Decide whether a call may proceed, moving OPEN to HALF_OPEN once the
    /// cooldown has elapsed. Rejection carries the remaining cooldown.
    fn admit(
        &mut self,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Result<Option<(CircuitState, CircuitState)>, u64> {
        if self.state != CircuitState::Open {
            return Ok(None);
        }

        let cooldown = Duration::from_millis(config.cooldown_ms);
        let elapsed = self
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or(cooldown);

        if elapsed >= cooldown {
            self.state = CircuitState::HalfOpen;
            self.consecutive_successes = 0;
            Ok(Some((CircuitState::Open, CircuitState::HalfOpen)))
        } else {
            Err((cooldown - elapsed).as_millis() as u64)
        }
    }

    fn on_success(&mut self, config: &CircuitBreakerConfig) -> Option<(CircuitState, CircuitState)> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            // A call admitted before the circuit opened; it proves nothing.
            CircuitState::Open => None,
        }
    }

    fn on_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Option<(CircuitState, CircuitState)> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;

        match self.state {
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                Some((CircuitState::Closed, CircuitState::Open))
            }
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

/// Registry of breakers keyed by resource
pub struct CircuitBreakerRegistry {
    /// Configuration applied to every breaker
    config: CircuitBreakerConfig,

    /// Breakers, created lazily on first use of a key
    breakers: Mutex<HashMap<String, BreakerState>>,

    /// Observer for state changes
    hook: RwLock<Option<TransitionHook>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!("Creating circuit breaker registry with config: {:?}", config);
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            hook: RwLock::new(None),
        }
    }

    /// Configuration shared by every breaker
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register the observer called on every transition
    pub fn set_transition_hook(&self, hook: TransitionHook) {
        *self.hook.write() = Some(hook);
    }

    /// Run `operation` under the breaker for `resource`
    ///
    /// Fails fast with `ConduitError::CircuitOpen` while the circuit is open
    /// and the cooldown has not elapsed; `operation` is not invoked then.
    pub async fn execute<F, Fut, T>(&self, resource: &str, operation: F) -> ConduitResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConduitResult<T>>,
    {
        // Decide under the lock, release it before awaiting
        let admission = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(resource.to_string()).or_default();
            trace!(
                "Breaker {} is {} with {} failures",
                resource,
                breaker.state,
                breaker.consecutive_failures
            );
            breaker
                .admit(&self.config, Instant::now())
                .map_err(|retry_after_ms| (retry_after_ms, breaker.consecutive_failures))
        };

        match admission {
            Err((retry_after_ms, failures)) => {
                debug!("Breaker {} rejected call, {}ms of cooldown left", resource, retry_after_ms);
                return Err(ConduitError::CircuitOpen {
                    resource: resource.to_string(),
                    failures,
                    retry_after_ms,
                });
            }
            Ok(Some(change)) => self.notify(resource, change),
            Ok(None) => {}
        }

        let result = operation().await;

        let change = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(resource.to_string()).or_default();
            match &result {
                Ok(_) => breaker.on_success(&self.config),
                Err(e) if e.is_breaker_failure() => {
                    debug!(
                        "Breaker {} recorded failure {}/{}: {}",
                        resource,
                        breaker.consecutive_failures + 1,
                        self.config.failure_threshold,
                        e
                    );
                    breaker.on_failure(&self.config, Instant::now())
                }
                Err(e) => {
                    trace!("Breaker {} ignoring non-transport error: {}", resource, e);
                    None
                }
            }
        };

        if let Some(change) = change {
            self.notify(resource, change);
        }

        result
    }

    /// Read view of the breaker for `resource`; unknown keys read as closed
    pub fn get_state(&self, resource: &str) -> BreakerSnapshot {
        self.breakers
            .lock()
            .get(resource)
            .map(BreakerState::snapshot)
            .unwrap_or_default()
    }

    /// Read views of every breaker created so far
    pub fn snapshot_all(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.snapshot()))
            .collect()
    }

    /// Force the breaker for `resource` back to closed
    pub fn reset(&self, resource: &str) {
        let previous = {
            let mut breakers = self.breakers.lock();
            breakers
                .insert(resource.to_string(), BreakerState::default())
                .map(|b| b.state)
        };

        if let Some(from) = previous.filter(|s| *s != CircuitState::Closed) {
            info!("Breaker {} manually reset", resource);
            self.notify(resource, (from, CircuitState::Closed));
        }
    }

    fn notify(&self, resource: &str, (from, to): (CircuitState, CircuitState)) {
        match to {
            CircuitState::Open => warn!("Circuit breaker {} {} -> {}", resource, from, to),
            _ => info!("Circuit breaker {} {} -> {}", resource, from, to),
        }

        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(&BreakerTransition {
                resource: resource.to_string(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(failure_threshold: u32, success_threshold: u32, cooldown_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            cooldown_ms,
        })
    }

    async fn fail(reg: &CircuitBreakerRegistry, key: &str) -> ConduitResult<()> {
        reg.execute(key, || async { Err::<(), _>(ConduitError::upstream("503 Service Unavailable")) })
            .await
    }

    async fn succeed(reg: &CircuitBreakerRegistry, key: &str) -> ConduitResult<()> {
        reg.execute(key, || async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_unknown_key_reads_closed() {
        let reg = registry(3, 1, 1000);
        assert_eq!(reg.get_state("price"), BreakerSnapshot::default());
        assert!(reg.snapshot_all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let reg = registry(3, 1, 1000);
        for _ in 0..3 {
            assert!(fail(&reg, "news").await.is_err());
        }
        assert_eq!(reg.get_state("news").state, CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = reg
            .execute("news", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match result {
            Err(ConduitError::CircuitOpen { resource, failures, retry_after_ms }) => {
                assert_eq!(resource, "news");
                assert_eq!(failures, 3);
                assert_eq!(retry_after_ms, 1000);
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let reg = registry(3, 1, 1000);
        fail(&reg, "price").await.ok();
        fail(&reg, "price").await.ok();
        succeed(&reg, "price").await.unwrap();
        fail(&reg, "price").await.ok();

        let snapshot = reg.get_state("price");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_application_errors_do_not_trip() {
        let reg = registry(1, 1, 1000);
        for _ in 0..5 {
            let result = reg
                .execute("metrics", || async { Err::<(), _>(ConduitError::Validation("bad ticker".to_string())) })
                .await;
            assert!(matches!(result, Err(ConduitError::Validation(_))));
            let result = reg
                .execute("metrics", || async { Err::<(), _>(ConduitError::upstream("symbol not listed")) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(reg.get_state("metrics").state, CircuitState::Closed);
        assert_eq!(reg.get_state("metrics").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let reg = registry(2, 2, 500);
        fail(&reg, "factors").await.ok();
        fail(&reg, "factors").await.ok();
        assert_eq!(reg.get_state("factors").state, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;

        succeed(&reg, "factors").await.unwrap();
        let snapshot = reg.get_state("factors");
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.consecutive_successes, 1);

        succeed(&reg, "factors").await.unwrap();
        assert_eq!(reg.get_state("factors"), BreakerSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let reg = registry(1, 3, 1000);
        fail(&reg, "news").await.ok();
        tokio::time::advance(Duration::from_millis(1000)).await;

        fail(&reg, "news").await.ok();
        assert_eq!(reg.get_state("news").state, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(600)).await;
        match succeed(&reg, "news").await {
            Err(ConduitError::CircuitOpen { retry_after_ms, .. }) => assert_eq!(retry_after_ms, 400),
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_breakers_are_independent_per_key() {
        let reg = registry(1, 1, 60_000);
        fail(&reg, "news").await.ok();
        assert_eq!(reg.get_state("news").state, CircuitState::Open);
        assert!(succeed(&reg, "price").await.is_ok());
        assert_eq!(reg.snapshot_all().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_hook_sees_every_change() {
        let reg = registry(1, 1, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        reg.set_transition_hook(Arc::new(move |t: &BreakerTransition| sink.lock().push((t.from, t.to))));

        fail(&reg, "price").await.ok();
        tokio::time::advance(Duration::from_millis(100)).await;
        succeed(&reg, "price").await.unwrap();
        fail(&reg, "price").await.ok();
        reg.reset("price");

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }
}
