//! Cosmetic ball-release flags. These writes never gate coordination.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    dao::{
        models::{RoomDocument, RoomUpdate},
        room_store::RoomStore,
    },
    dto::{team::ReleasedTeam, validation::MAX_TEAM_SLOTS},
    error::LobbyError,
    state::role::Seat,
};

/// Writes one seat's release animation state.
#[derive(Clone)]
pub struct ReleaseSync {
    store: Arc<dyn RoomStore>,
    room_id: String,
    seat: Seat,
    animation: Duration,
}

impl ReleaseSync {
    /// Release writer for `seat` in `room_id`.
    pub fn new(
        store: Arc<dyn RoomStore>,
        room_id: impl Into<String>,
        seat: Seat,
        animation: Duration,
    ) -> Self {
        Self {
            store,
            room_id: room_id.into(),
            seat,
            animation,
        }
    }

    /// Mark `slot` as animating, then as released once the animation completes.
    pub async fn release_ball(&self, slot: u8) -> Result<(), LobbyError> {
        if usize::from(slot) >= MAX_TEAM_SLOTS {
            return Err(LobbyError::TeamInvalid(format!("no team slot {slot}")));
        }

        let room = self.load().await?;
        let mut animating = room.animating_balls(self.seat).clone();
        let released = room.released_balls(self.seat).clone();
        if animating.contains(&slot) || released.contains(&slot) {
            debug!(room_id = %self.room_id, slot, "ball already released");
            return Ok(());
        }
        animating.insert(slot);
        self.store
            .update_room(
                &self.room_id,
                RoomUpdate::release_animation(self.seat, animating, released),
            )
            .await?;

        tokio::time::sleep(self.animation).await;

        let room = self.load().await?;
        let mut animating = room.animating_balls(self.seat).clone();
        let mut released = room.released_balls(self.seat).clone();
        animating.remove(&slot);
        released.insert(slot);
        self.store
            .update_room(
                &self.room_id,
                RoomUpdate::release_animation(self.seat, animating, released),
            )
            .await?;
        Ok(())
    }

    /// Publish the snapshot of the team that was sent out.
    pub async fn release_team(&self, team: ReleasedTeam) -> Result<(), LobbyError> {
        self.store
            .update_room(&self.room_id, RoomUpdate::released_team(self.seat, team))
            .await?;
        Ok(())
    }

    async fn load(&self) -> Result<RoomDocument, LobbyError> {
        self.store
            .get_room(&self.room_id)
            .await?
            .ok_or_else(|| LobbyError::RoomMissing(self.room_id.clone()))
    }
}
