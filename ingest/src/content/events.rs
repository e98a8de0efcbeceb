use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Change notifications for the outward-facing layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CatalogEvent {
    ObjectAdded { id: i64, parent_id: i64 },
    ObjectUpdated { id: i64 },
    ObjectRemoved { id: i64, parent_id: i64 },
    ContainerChanged { id: i64 },
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<CatalogEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: CatalogEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub(crate) fn object_added(&self, id: i64, parent_id: i64) {
        self.publish(CatalogEvent::ObjectAdded { id, parent_id });
        self.publish(CatalogEvent::ContainerChanged { id: parent_id });
    }

    pub(crate) fn object_removed(&self, id: i64, parent_id: i64) {
        self.publish(CatalogEvent::ObjectRemoved { id, parent_id });
        self.publish(CatalogEvent::ContainerChanged { id: parent_id });
    }
}
