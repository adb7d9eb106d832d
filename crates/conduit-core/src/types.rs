use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::ConduitError;

/// Opaque payload moved between fetchers, the cache and callers
pub type Payload = Value;

/// Kind of data an entity can be loaded as.
///
/// Each kind maps to its own upstream endpoint, breaker and priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataKind {
    /// Live quote
    Price,
    /// Key metrics and ratios
    Metrics,
    /// Statements
    Financials,
    /// Analyst estimates
    AnalystEstimates,
    /// Factor exposures
    Factors,
    /// Headlines
    News,
    /// Any other endpoint, by name
    Other(String),
}

impl DataKind {
    /// Dispatch priority for this kind; lower runs first
    pub fn priority(&self) -> i32 {
        match self {
            DataKind::Price => 1,
            DataKind::Metrics => 2,
            DataKind::Financials | DataKind::AnalystEstimates => 3,
            DataKind::Factors => 4,
            DataKind::News | DataKind::Other(_) => 5,
        }
    }

    /// Kebab-case name used in keys and URLs
    pub fn as_str(&self) -> &str {
        match self {
            DataKind::Price => "price",
            DataKind::Metrics => "metrics",
            DataKind::Financials => "financials",
            DataKind::AnalystEstimates => "analyst-estimates",
            DataKind::Factors => "factors",
            DataKind::News => "news",
            DataKind::Other(name) => name,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "" => Err(ConduitError::Validation("data kind must not be empty".to_string())),
            "price" => Ok(DataKind::Price),
            "metrics" => Ok(DataKind::Metrics),
            "financials" => Ok(DataKind::Financials),
            "analyst-estimates" => Ok(DataKind::AnalystEstimates),
            "factors" => Ok(DataKind::Factors),
            "news" => Ok(DataKind::News),
            other => Ok(DataKind::Other(other.to_string())),
        }
    }
}

impl TryFrom<String> for DataKind {
    type Error = ConduitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataKind> for String {
    fn from(kind: DataKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Composite cache key, `<entity>:<kind>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for an entity and kind
    pub fn new(entity: &str, kind: &DataKind) -> Self {
        Self(format!("{}:{}", entity, kind))
    }

    /// Borrow the key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Serializable description of a write, replayable after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    /// Operation name, e.g. `watchlist.add`
    pub operation: String,
    /// Entity the write targets
    pub target: String,
    /// Operation body
    #[serde(default)]
    pub payload: Value,
}

impl WriteRequest {
    /// Create a write request
    pub fn new(operation: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            target: target.into(),
            payload,
        }
    }
}

/// Result of submitting a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The upstream applied the write
    Applied(Payload),
    /// The write was queued offline and will be replayed later
    Deferred {
        /// Offline queue item id
        id: String,
    },
}

impl WriteOutcome {
    /// Whether the write is still pending replay
    pub fn is_deferred(&self) -> bool {
        matches!(self, WriteOutcome::Deferred { .. })
    }
}
