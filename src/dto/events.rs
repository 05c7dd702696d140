use serde::Serialize;

use crate::{dao::models::RoomDocument, dto::handoff::HandoffParams};

/// Raised when the opponent disappears from a room that had both seats filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForfeitSignal {
    pub room_id: String,
    /// Display name of the player that left, when it was known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opponent_name: Option<String>,
    /// The host ended the room instead of just leaving the seat.
    pub room_finished: bool,
}

/// Notifications fanned out to listeners of a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A new, non-identical snapshot was accepted.
    RoomUpdated(RoomDocument),
    OpponentForfeited(ForfeitSignal),
    /// An operation failed in a way the player should hear about.
    ActionFailed { message: String },
    HandedOff(HandoffParams),
    #[serde(rename_all = "camelCase")]
    HandoffPhaseChanged { phase: String, version: usize },
    RoomMissing { room_id: String },
}

impl SessionEvent {
    /// Stable event name, mirroring the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::RoomUpdated(_) => "room_updated",
            SessionEvent::OpponentForfeited(_) => "opponent_forfeited",
            SessionEvent::ActionFailed { .. } => "action_failed",
            SessionEvent::HandedOff(_) => "handed_off",
            SessionEvent::HandoffPhaseChanged { .. } => "handoff_phase_changed",
            SessionEvent::RoomMissing { .. } => "room_missing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let event = SessionEvent::HandoffPhaseChanged {
            phase: "grace".into(),
            version: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "handoffPhaseChanged");
        assert_eq!(json["phase"], "grace");
        assert_eq!(event.name(), "handoff_phase_changed");

        let forfeit = SessionEvent::OpponentForfeited(ForfeitSignal {
            room_id: "r1".into(),
            opponent_name: None,
            room_finished: true,
        });
        let json = serde_json::to_value(&forfeit).unwrap();
        assert_eq!(json["roomFinished"], true);
        assert!(json.get("opponentName").is_none());
    }
}
