//!
//! Conduit Core - shared vocabulary for the Conduit data layer
//!
//! This crate defines the error taxonomy, the domain types passed between
//! components and the `Fetcher` capability the orchestrator consumes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Error types
pub mod error;

/// Domain types
pub mod types;

/// Upstream fetcher capability
pub mod fetcher;

pub use error::{ConduitError, ConduitResult, FailureClass};
pub use fetcher::Fetcher;
pub use types::{CacheKey, DataKind, Payload, WriteOutcome, WriteRequest};
