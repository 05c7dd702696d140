use serde::{Deserialize, Serialize};

use crate::state::role::Seat;

/// Parameter bundle handed to the battle runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffParams {
    pub room_id: String,
    pub battle_id: String,
    pub role: Seat,
    pub is_host: bool,
    pub user_id: String,
    pub user_name: String,
}

impl HandoffParams {
    /// Bundle for `user_id` entering `battle_id` from `seat`.
    pub fn new(
        room_id: impl Into<String>,
        battle_id: impl Into<String>,
        role: Seat,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            battle_id: battle_id.into(),
            role,
            is_host: role == Seat::Host,
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_wire_names() {
        let params = HandoffParams::new("r1", "b1", Seat::Guest, "u1", "Blue");
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "roomId": "r1",
                "battleId": "b1",
                "role": "guest",
                "isHost": false,
                "userId": "u1",
                "userName": "Blue"
            })
        );
    }
}
