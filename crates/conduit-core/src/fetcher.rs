use async_trait::async_trait;

use crate::error::ConduitResult;
use crate::types::{DataKind, Payload, WriteRequest};

/// Upstream capability consumed by the orchestrator.
///
/// A fetcher returns the raw payload for an entity and kind, or an error
/// whose class decides whether the kind's breaker counts it. Use
/// `ConduitError::upstream` to have the message classified.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the raw payload for `entity` as `kind`
    async fn fetch(&self, entity: &str, kind: &DataKind) -> ConduitResult<Payload>;

    /// Apply a write upstream
    async fn write(&self, request: &WriteRequest) -> ConduitResult<Payload>;
}
