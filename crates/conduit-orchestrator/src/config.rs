//! Configuration for the Conduit data layer
//!
//! Defaults, then an optional YAML file named by `CONDUIT_CONFIG`, then
//! `CONDUIT_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use tracing::{info, warn};

use conduit_core::{ConduitError, ConduitResult};
use conduit_monitoring::{MetricsConfig, MonitoringConfig};
use conduit_resilience::{CircuitBreakerConfig, OfflineQueueConfig, SchedulerConfig};

use crate::cache::CacheSettings;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Cache sizing and expiry
    #[serde(default)]
    pub cache: CacheSettings,

    /// Breaker thresholds, shared by every resource key
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Scheduler concurrency
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Offline write queue
    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,

    /// Metrics collector
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Base URL of the upstream data API
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,

    /// Per-request timeout of the HTTP fetcher (in milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Directory holding persisted state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs
    #[serde(default)]
    pub json_logs: bool,
}

fn default_upstream_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_state_dir() -> String {
    ".conduit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            offline_queue: OfflineQueueConfig::default(),
            metrics: MetricsConfig::default(),
            upstream_base_url: default_upstream_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            state_dir: default_state_dir(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ConduitConfig {
    /// Load configuration from the process environment
    pub fn load() -> ConduitResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration reading variables through `lookup`
    pub fn from_lookup<L>(lookup: L) -> ConduitResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("CONDUIT_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    ConduitError::Configuration(format!("Cannot read config file {}: {}", path, e))
                })?;
                let config = Self::from_yaml(&text)?;
                info!("Loaded configuration file {}", path);
                config
            }
            None => Self::default(),
        };

        override_parsed(&lookup, "CONDUIT_CACHE_MAX_SIZE", &mut config.cache.max_size);
        override_parsed(&lookup, "CONDUIT_CACHE_TTL_MS", &mut config.cache.ttl_ms);
        override_parsed(&lookup, "CONDUIT_CACHE_PRUNE_INTERVAL_MS", &mut config.cache.prune_interval_ms);
        override_parsed(
            &lookup,
            "CONDUIT_BREAKER_FAILURE_THRESHOLD",
            &mut config.circuit_breaker.failure_threshold,
        );
        override_parsed(
            &lookup,
            "CONDUIT_BREAKER_SUCCESS_THRESHOLD",
            &mut config.circuit_breaker.success_threshold,
        );
        override_parsed(&lookup, "CONDUIT_BREAKER_COOLDOWN_MS", &mut config.circuit_breaker.cooldown_ms);
        override_parsed(&lookup, "CONDUIT_CONCURRENCY", &mut config.scheduler.concurrency);
        override_parsed(&lookup, "CONDUIT_OFFLINE_MAX_ATTEMPTS", &mut config.offline_queue.max_attempts);
        override_parsed(&lookup, "CONDUIT_LATENCY_WINDOW", &mut config.metrics.latency_window);
        override_parsed(&lookup, "CONDUIT_MAX_ERROR_LABELS", &mut config.metrics.max_error_labels);
        override_parsed(&lookup, "CONDUIT_REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms);
        override_parsed(&lookup, "CONDUIT_JSON_LOGS", &mut config.json_logs);

        if let Some(key) = lookup("CONDUIT_OFFLINE_STORAGE_KEY") {
            config.offline_queue.storage_key = key;
        }
        if let Some(url) = lookup("CONDUIT_UPSTREAM_URL") {
            config.upstream_base_url = url;
        }
        if let Some(dir) = lookup("CONDUIT_STATE_DIR") {
            config.state_dir = dir;
        }
        if let Some(level) = lookup("CONDUIT_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        info!("Loaded conduit configuration");
        Ok(config)
    }

    /// Parse a YAML document; absent fields take their defaults
    pub fn from_yaml(text: &str) -> ConduitResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| ConduitError::Configuration(format!("Invalid configuration file: {}", e)))
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> ConduitResult<()> {
        let checks = [
            (self.cache.max_size == 0, "cache.max_size must be at least 1"),
            (self.cache.prune_interval_ms == 0, "cache.prune_interval_ms must be positive"),
            (self.scheduler.concurrency == 0, "scheduler.concurrency must be at least 1"),
            (
                self.circuit_breaker.failure_threshold == 0,
                "circuit_breaker.failure_threshold must be at least 1",
            ),
            (
                self.circuit_breaker.success_threshold == 0,
                "circuit_breaker.success_threshold must be at least 1",
            ),
            (self.offline_queue.max_attempts == 0, "offline_queue.max_attempts must be at least 1"),
            (self.offline_queue.storage_key.is_empty(), "offline_queue.storage_key is required"),
            (self.upstream_base_url.is_empty(), "upstream_base_url is required"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConduitError::Configuration(message.to_string())),
            None => Ok(()),
        }
    }

    /// Monitoring settings derived from this configuration
    pub fn monitoring_config(&self) -> MonitoringConfig {
        MonitoringConfig {
            log_filter: self.log_level.clone(),
            enable_json_logging: self.json_logs,
            ..MonitoringConfig::default()
        }
    }
}

fn override_parsed<L, T>(lookup: &L, name: &str, target: &mut T)
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(e) => warn!("Invalid {} value: {} ({})", name, raw, e),
        }
    }
}
