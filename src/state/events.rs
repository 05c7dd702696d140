use tokio::sync::broadcast;

use crate::dto::events::SessionEvent;

/// Broadcast hub fanning session events out to every listener.
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    /// Construct a hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}
