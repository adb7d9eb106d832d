//! Request, cache and breaker metrics.
//!
//! The collector keeps its own counters so a snapshot is always available
//! in-process; every record is mirrored onto the `metrics` facade for
//! whichever recorder is installed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::trace;

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Number of most recent latency samples kept for percentiles
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Distinct error labels tracked before new ones fold into `other`
    #[serde(default = "default_max_error_labels")]
    pub max_error_labels: usize,
}

fn default_latency_window() -> usize {
    1000
}

fn default_max_error_labels() -> usize {
    100
}

/// Histogram label that absorbs errors past the label cap
pub const OVERFLOW_ERROR_LABEL: &str = "other";

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_window: default_latency_window(),
            max_error_labels: default_max_error_labels(),
        }
    }
}

/// Request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounters {
    /// All recorded requests
    pub total: u64,
    /// Requests that succeeded
    pub success: u64,
    /// Requests that failed
    pub failed: u64,
}

impl RequestCounters {
    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Cache counters with the derived hit rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheCounters {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// hits / (hits + misses), 0 when nothing was looked up
    pub hit_rate: f64,
}

/// Latency summary over the sample window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Samples in the window
    pub samples: usize,
    /// Mean latency in milliseconds
    pub avg_ms: f64,
    /// Median latency in milliseconds
    pub p50_ms: f64,
    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,
}

/// Immutable view of the collector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Request counters across all kinds
    pub requests: RequestCounters,
    /// Request counters per data kind
    pub requests_by_kind: BTreeMap<String, RequestCounters>,
    /// Cache counters
    pub cache: CacheCounters,
    /// Breaker transitions, counted by the state entered
    pub circuit_transitions: BTreeMap<String, u64>,
    /// Latency summary
    pub latency: LatencySummary,
    /// Error messages and how often each was seen
    pub errors: BTreeMap<String, u64>,
    /// failed / total, 0 when nothing was recorded
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct MetricsState {
    requests: RequestCounters,
    requests_by_kind: BTreeMap<String, RequestCounters>,
    cache_hits: u64,
    cache_misses: u64,
    circuit_transitions: BTreeMap<String, u64>,
    latencies: VecDeque<f64>,
    errors: BTreeMap<String, u64>,
}

/// Collector for request, cache and breaker metrics
#[derive(Debug)]
pub struct MetricsCollector {
    latency_window: usize,
    max_error_labels: usize,
    state: Mutex<MetricsState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsCollector {
    /// Create a collector
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            latency_window: config.latency_window.max(1),
            max_error_labels: config.max_error_labels.max(1),
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Record a completed request
    pub fn record_request(&self, kind: &str, success: bool, latency_ms: f64) {
        {
            let mut state = self.state.lock();
            state.requests.record(success);
            state
                .requests_by_kind
                .entry(kind.to_string())
                .or_default()
                .record(success);

            if state.latencies.len() == self.latency_window {
                state.latencies.pop_front();
            }
            state.latencies.push_back(latency_ms);
        }

        trace!("Request kind={} success={} latency={}ms", kind, success, latency_ms);
        ::metrics::increment_counter!(
            "conduit_requests_total",
            "kind" => kind.to_string(),
            "outcome" => if success { "success" } else { "failure" }
        );
        ::metrics::histogram!("conduit_request_latency_ms", latency_ms, "kind" => kind.to_string());
    }

    /// Record a cache lookup
    pub fn record_cache(&self, hit: bool) {
        {
            let mut state = self.state.lock();
            if hit {
                state.cache_hits += 1;
            } else {
                state.cache_misses += 1;
            }
        }

        if hit {
            ::metrics::increment_counter!("conduit_cache_hits_total");
        } else {
            ::metrics::increment_counter!("conduit_cache_misses_total");
        }
    }

    /// Record a breaker entering `state`
    pub fn record_circuit_state(&self, state: impl fmt::Display) {
        let state = state.to_string();
        *self
            .state
            .lock()
            .circuit_transitions
            .entry(state.clone())
            .or_insert(0) += 1;

        ::metrics::increment_counter!("conduit_circuit_transitions_total", "state" => state);
    }

    /// Record an error message in the histogram
    ///
    /// Once `max_error_labels` distinct messages are tracked, unseen ones
    /// are counted under [`OVERFLOW_ERROR_LABEL`].
    pub fn record_error(&self, message: &str) {
        {
            let mut state = self.state.lock();
            let tracked = state.errors.contains_key(message);
            let label = if tracked || state.errors.len() < self.max_error_labels {
                message
            } else {
                OVERFLOW_ERROR_LABEL
            };
            *state.errors.entry(label.to_string()).or_insert(0) += 1;
        }

        ::metrics::increment_counter!("conduit_errors_total");
    }

    /// Snapshot with derived rates and percentiles computed now
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock();

        let lookups = state.cache_hits + state.cache_misses;
        let hit_rate = ratio(state.cache_hits, lookups);
        let error_rate = ratio(state.requests.failed, state.requests.total);

        MetricsSnapshot {
            requests: state.requests,
            requests_by_kind: state.requests_by_kind.clone(),
            cache: CacheCounters {
                hits: state.cache_hits,
                misses: state.cache_misses,
                hit_rate,
            },
            circuit_transitions: state.circuit_transitions.clone(),
            latency: summarize(&state.latencies),
            errors: state.errors.clone(),
            error_rate,
        }
    }

    /// Clear every counter and sample
    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn summarize(samples: &VecDeque<f64>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    LatencySummary {
        samples: sorted.len(),
        avg_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
