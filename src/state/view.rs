use std::hash::{DefaultHasher, Hash, Hasher};

use crate::dao::models::RoomDocument;

/// Latest accepted room snapshot of a session plus its content signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomView {
    room: Option<RoomDocument>,
    signature: u64,
    /// At least one delivery (snapshot or absence) has been seen.
    initialized: bool,
}

impl RoomView {
    /// Current room, if present.
    pub fn room(&self) -> Option<&RoomDocument> {
        self.room.as_ref()
    }

    /// Whether a first delivery arrived.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The store reported the room as deleted or never created.
    pub fn is_absent(&self) -> bool {
        self.initialized && self.room.is_none()
    }

    /// Hash of the canonical snapshot.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// Build the view for a delivery; `None` marks an absent room.
    pub fn from_delivery(room: Option<RoomDocument>) -> Self {
        let signature = room.as_ref().map(signature_of).unwrap_or(0);
        Self {
            room,
            signature,
            initialized: true,
        }
    }

    /// Whether `next` carries nothing new compared to this view.
    pub fn is_same_as(&self, next: &RoomView) -> bool {
        self.initialized
            && next.initialized
            && self.signature == next.signature
            && self.room.is_some() == next.room.is_some()
    }
}

/// Content hash of a snapshot; identical re-deliveries share it.
pub fn signature_of(room: &RoomDocument) -> u64 {
    let mut hasher = DefaultHasher::new();
    match serde_json::to_vec(room) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(_) => format!("{room:?}").hash(&mut hasher),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::role::{Identity, Seat};
    use crate::dao::models::RoomUpdate;

    #[test]
    fn identical_redeliveries_are_detected() {
        let room = RoomDocument::new("r1", &Identity::new("h", "Red"), None);
        let a = RoomView::from_delivery(Some(room.clone()));
        let b = RoomView::from_delivery(Some(room.clone()));
        assert!(a.is_same_as(&b));

        let mut changed = room;
        RoomUpdate::ready(Seat::Host, true).apply(&mut changed);
        assert!(!a.is_same_as(&RoomView::from_delivery(Some(changed))));
    }

    #[test]
    fn absence_differs_from_presence() {
        let room = RoomDocument::new("r1", &Identity::new("h", "Red"), None);
        let present = RoomView::from_delivery(Some(room));
        let absent = RoomView::from_delivery(None);
        assert!(!present.is_same_as(&absent));
        assert!(absent.is_absent());
        assert!(!RoomView::default().is_absent());
    }
}
