//! Lifecycle notifications
//!
//! Loads publish `Loading`, then `Loaded` or `Error`, keyed by entity and
//! kind. The offline write path publishes its own events. Subscribers get
//! every event from the moment they subscribe; a slow subscriber that falls
//! more than the channel capacity behind sees `RecvError::Lagged`.

use tokio::sync::broadcast;
use tracing::trace;

use conduit_core::{ConduitError, DataKind, WriteRequest};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event published by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    /// A fetch was scheduled
    Loading {
        /// Entity key
        entity: String,
        /// Data kind
        kind: DataKind,
    },
    /// Data is available
    Loaded {
        /// Entity key
        entity: String,
        /// Data kind
        kind: DataKind,
        /// Whether it was served from cache
        cached: bool,
    },
    /// A load failed
    Error {
        /// Entity key
        entity: String,
        /// Data kind
        kind: DataKind,
        /// The error returned to callers
        error: ConduitError,
    },
    /// A write was queued for later replay
    WriteDeferred {
        /// Offline queue item id
        id: String,
        /// The deferred write
        request: WriteRequest,
    },
    /// A deferred write was applied
    WriteReplayed {
        /// Offline queue item id
        id: String,
    },
    /// A deferred write was given up on
    WriteDropped {
        /// Offline queue item id
        id: String,
        /// Failed attempts
        attempts: u32,
        /// Message of the final failure
        last_error: Option<String>,
    },
}

impl DataEvent {
    /// `(entity, kind)` for load events
    pub fn key(&self) -> Option<(&str, &DataKind)> {
        match self {
            DataEvent::Loading { entity, kind }
            | DataEvent::Loaded { entity, kind, .. }
            | DataEvent::Error { entity, kind, .. } => Some((entity.as_str(), kind)),
            _ => None,
        }
    }

    /// Whether this is a load event for `entity` and `kind`
    pub fn concerns(&self, entity: &str, kind: &DataKind) -> bool {
        self.key() == Some((entity, kind))
    }
}

/// Typed publish/subscribe channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DataEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: DataEvent) -> usize {
        trace!("Publishing {:?}", event);
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
