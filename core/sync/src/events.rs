//! Outward-facing events for the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use lifetrack_common::Domain;

use crate::conflict::ResolutionKind;

/// Default number of events buffered per subscriber.
const DEFAULT_CAPACITY: usize = 64;

/// Events the sync engine publishes for transient banners and alerts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A 409 from the backend was reconciled.
    ConflictResolved {
        operation_label: String,
        message: String,
        resolution: ResolutionKind,
    },
    /// A write was saved locally and will be delivered later.
    OfflineItemQueued { id: String, description: String },
    /// A queued write exhausted its retries and needs user action.
    OfflineItemPermanentlyFailed {
        id: String,
        description: String,
        last_error: String,
    },
    /// A domain sync finished.
    DomainSynced {
        domain: Domain,
        from_cache: bool,
        error: Option<String>,
    },
}

/// Broadcast bus for [`SyncEvent`]s.
///
/// Publishing never blocks and never fails; events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: SyncEvent) {
        match self.tx.send(event) {
            Ok(receivers) => debug!("Published sync event to {} subscribers", receivers),
            Err(broadcast::error::SendError(event)) => {
                debug!("No subscribers for sync event: {:?}", event)
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
