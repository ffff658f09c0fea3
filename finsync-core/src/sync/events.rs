//! Sync notifications for the UI layer.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    CycleStarted,
    /// A pull changed the local store.
    DataRefreshed { imported: usize },
    /// First pull after install or pairing brought in transactions.
    InitialSyncComplete,
    DevicesLinked { installation_ids: Vec<Uuid> },
    CycleFailed { message: String },
}

/// Publish/subscribe channel owned by the orchestrator.
///
/// Listeners register with [`subscribe`](EventBus::subscribe) and deregister
/// by dropping the receiver. After [`close`](EventBus::close) returns no
/// further event is sent.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    open: Mutex<bool>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            open: Mutex::new(true),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Deliver to current listeners. Returns whether the event was sent.
    pub fn emit(&self, event: SyncEvent) -> bool {
        let Ok(open) = self.open.lock() else {
            return false;
        };
        if !*open {
            return false;
        }
        // No listeners is not an error
        self.sender.send(event).is_ok()
    }

    pub fn close(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = false;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.open.lock().map(|open| !*open).unwrap_or(true)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
