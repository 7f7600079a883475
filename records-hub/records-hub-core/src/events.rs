use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Structural change notifications for live subscribers.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Event {
    Created {
        id: Uuid,
        owner: String,
    },
    Renamed {
        id: Uuid,
        name: String,
    },
    Moved {
        id: Uuid,
        new_parent: Option<Uuid>,
    },
    Deleted {
        id: Uuid,
        cascade: usize,
    },
    Shared {
        id: Uuid,
        grant: Uuid,
        principal: String,
    },
    Revoked {
        id: Uuid,
        grant: Uuid,
        principal: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
