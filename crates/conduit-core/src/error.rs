use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of an upstream failure.
///
/// Only the first three classes count against a circuit breaker; an
/// application-level failure means the upstream answered and said no.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Upstream reported itself unavailable (502/503/504 and friends)
    ServiceUnavailable,
    /// The call did not complete in time
    Timeout,
    /// Transport-level failure: connect, DNS, reset
    Network,
    /// The upstream answered with an error of its own
    Application,
}

impl FailureClass {
    /// Classify a failure from its message
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        const UNAVAILABLE: [&str; 6] = [
            "503",
            "502",
            "504",
            "service unavailable",
            "bad gateway",
            "gateway timeout",
        ];
        const TIMEOUT: [&str; 3] = ["timeout", "timed out", "deadline exceeded"];
        const NETWORK: [&str; 8] = [
            "network",
            "connection",
            "connect",
            "dns",
            "reset",
            "refused",
            "unreachable",
            "fetch failed",
        ];

        if UNAVAILABLE.iter().any(|s| lower.contains(s)) {
            FailureClass::ServiceUnavailable
        } else if TIMEOUT.iter().any(|s| lower.contains(s)) {
            FailureClass::Timeout
        } else if NETWORK.iter().any(|s| lower.contains(s)) {
            FailureClass::Network
        } else {
            FailureClass::Application
        }
    }

    /// Whether a failure of this class should count against a breaker
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, FailureClass::Application)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::ServiceUnavailable => write!(f, "service_unavailable"),
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::Network => write!(f, "network"),
            FailureClass::Application => write!(f, "application"),
        }
    }
}

/// Error type shared by every Conduit component
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConduitError {
    /// Circuit for the resource is open; no upstream call was attempted
    #[error("Circuit open for {resource} after {failures} failures. Retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Resource key the breaker guards
        resource: String,
        /// Consecutive failures that tripped the circuit
        failures: u32,
        /// Remaining cooldown in milliseconds
        retry_after_ms: u64,
    },

    /// Failure propagated from a fetcher, carrying the original message
    #[error("Upstream error ({class}): {message}")]
    Upstream {
        /// How the failure was classified
        class: FailureClass,
        /// Original message
        message: String,
    },

    /// Caller-supplied input was rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Durable state could not be read or written
    #[error("State store error: {0}")]
    StateStore(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A scheduled task did not deliver a result
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl ConduitError {
    /// Build an upstream error, classifying it from the message
    pub fn upstream(message: impl Into<String>) -> Self {
        let message = message.into();
        ConduitError::Upstream {
            class: FailureClass::classify(&message),
            message,
        }
    }

    /// Build an upstream error with an explicit class
    pub fn upstream_with_class(class: FailureClass, message: impl Into<String>) -> Self {
        ConduitError::Upstream {
            class,
            message: message.into(),
        }
    }

    /// Whether this error counts as a failure for circuit breaking
    pub fn is_breaker_failure(&self) -> bool {
        match self {
            ConduitError::Upstream { class, .. } => class.trips_breaker(),
            _ => false,
        }
    }

    /// Whether the error means the upstream could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ConduitError::CircuitOpen { .. }) || self.is_breaker_failure()
    }

    /// Message recorded in error histograms
    pub fn histogram_label(&self) -> String {
        match self {
            ConduitError::Upstream { message, .. } => message.clone(),
            ConduitError::CircuitOpen { resource, .. } => format!("circuit open: {}", resource),
            other => other.to_string(),
        }
    }
}

/// Result alias used across the workspace
pub type ConduitResult<T> = Result<T, ConduitError>;

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConduitError {
    fn from(err: serde_yaml::Error) -> Self {
        ConduitError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::StateStore(err.to_string())
    }
}
