use std::sync::Arc;

use tracing::{info, warn};
use validator::Validate;

use crate::{
    dao::{
        battle::{BattleMirror, BattleRequest, BattleService, Combatant},
        models::{RoomDocument, RoomStatus, RoomUpdate},
        room_store::RoomStore,
    },
    dto::handoff::HandoffParams,
    error::LobbyError,
    state::role::{Identity, Seat},
};

fn combatant(room: &RoomDocument, seat: Seat) -> Result<Combatant, LobbyError> {
    let user_id = room
        .participant(seat)
        .ok_or_else(|| LobbyError::StartBlocked("waiting for an opponent".into()))?;
    let team = room
        .team(seat)
        .ok_or_else(|| LobbyError::StartBlocked("both players need a team".into()))?;
    team.validate()?;
    Ok(Combatant {
        user_id: user_id.to_string(),
        name: room.participant_name(seat).unwrap_or_default().to_string(),
        team: team.clone(),
    })
}

/// Check every start precondition against `room` without side effects.
///
/// Returns the request to send to the battle engine when the host may start.
pub fn check_start_preconditions(
    room: &RoomDocument,
    user_id: &str,
) -> Result<BattleRequest, LobbyError> {
    if room.seat_of(user_id) != Some(Seat::Host) {
        return Err(LobbyError::NotHost);
    }
    if room.battle().is_some() || room.status == RoomStatus::Battling {
        return Err(LobbyError::StartBlocked("battle already assigned".into()));
    }
    if room.status == RoomStatus::Finished {
        return Err(LobbyError::StartBlocked("room is finished".into()));
    }
    if room.current_players != room.max_players || !room.both_seats_filled() {
        return Err(LobbyError::StartBlocked("waiting for an opponent".into()));
    }

    let host = combatant(room, Seat::Host)?;
    let guest = combatant(room, Seat::Guest)?;

    if !(room.host_ready && room.guest_ready) {
        return Err(LobbyError::StartBlocked("both players must be ready".into()));
    }
    if host.team.is_same_lineup(&guest.team) {
        return Err(LobbyError::IdenticalTeams);
    }

    Ok(BattleRequest {
        room_id: room.room_id.clone(),
        host,
        guest,
    })
}

/// Hand-off bundle for `user` when `room` shows a published battle they take part in.
pub fn handoff_target(room: &RoomDocument, user: &Identity) -> Option<HandoffParams> {
    if room.status != RoomStatus::Battling {
        return None;
    }
    let battle_id = room.battle()?;
    let seat = room.seat_of(&user.user_id)?;
    Some(HandoffParams::new(
        room.room_id.clone(),
        battle_id,
        seat,
        user.user_id.clone(),
        user.display_name.clone(),
    ))
}

/// Creates a battle and publishes its id into the room.
#[derive(Clone)]
pub struct BattleCoordinator {
    store: Arc<dyn RoomStore>,
    battles: Arc<dyn BattleService>,
    mirror: Arc<dyn BattleMirror>,
}

impl BattleCoordinator {
    /// Coordinator over the room store and battle collaborators.
    pub fn new(
        store: Arc<dyn RoomStore>,
        battles: Arc<dyn BattleService>,
        mirror: Arc<dyn BattleMirror>,
    ) -> Self {
        Self {
            store,
            battles,
            mirror,
        }
    }

    /// Create the battle, seed the mirror, then publish `{battling, battleId}` in one write.
    ///
    /// Mirror failures are logged and ignored. Any other failure leaves the room untouched.
    pub async fn create_and_publish(&self, request: BattleRequest) -> Result<String, LobbyError> {
        let room_id = request.room_id.clone();
        let battle_id = self.battles.create_battle(request.clone()).await?;
        info!(room_id = %room_id, battle_id = %battle_id, "battle created");

        if let Err(err) = self.mirror.hydrate(&battle_id, &request).await {
            let err = LobbyError::MirrorHydrationFailed(err);
            warn!(room_id = %room_id, battle_id = %battle_id, error = %err, "continuing without mirror");
        }

        match self
            .store
            .update_room(&room_id, RoomUpdate::battle_started(battle_id.clone()))
            .await
        {
            Ok(_) => {
                info!(room_id = %room_id, battle_id = %battle_id, "battle published");
                Ok(battle_id)
            }
            Err(err) if err.is_precondition_failed() => Err(LobbyError::BattleCreationFailed(
                "another battle was already published for this room".into(),
            )),
            Err(err) => Err(LobbyError::BattleCreationFailed(format!(
                "could not publish battle: {err}"
            ))),
        }
    }
}
