use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::{
        models::{Precondition, RoomDocument, RoomStatus, RoomUpdate},
        room_store::RoomStore,
        storage::StorageError,
    },
    dto::team::Team,
    error::LobbyError,
    state::role::{Identity, Seat},
};

/// Maximum number of rooms returned by [`RoomService::list_joinable_rooms`].
pub const LOBBY_PAGE_SIZE: usize = 20;

/// Result of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The caller already holds a seat; nothing changed apart from an optional team.
    AlreadySeated(Seat),
    /// The caller took the guest seat.
    Joined(RoomDocument),
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The host left and the room is now finished.
    RoomFinished,
    /// The guest seat was cleared.
    SeatReleased,
    /// Battling or finished room: only presence was written.
    PresenceOnly,
    /// The caller had no seat.
    NotSeated,
    /// The room no longer exists.
    Gone,
}

/// Lobby operations over the room store.
#[derive(Clone)]
pub struct RoomService {
    store: Arc<dyn RoomStore>,
}

impl RoomService {
    /// Service over `store`.
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> Arc<dyn RoomStore> {
        self.store.clone()
    }

    async fn load(&self, room_id: &str) -> Result<RoomDocument, LobbyError> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or_else(|| LobbyError::RoomMissing(room_id.to_string()))
    }

    /// Open a fresh room for `host`, dropping the host's stale lobby rooms first.
    pub async fn create_room(
        &self,
        host: &Identity,
        team: Option<Team>,
    ) -> Result<RoomDocument, LobbyError> {
        if let Some(team) = &team {
            team.validate()?;
        }

        let stale = self
            .store
            .list_rooms()
            .await?
            .into_iter()
            .filter(|room| room.host_id == host.user_id && room.status.is_open());
        for room in stale {
            debug!(room_id = %room.room_id, host_id = %host.user_id, "deleting stale room");
            if let Err(err) = self.store.delete_room(&room.room_id).await {
                warn!(room_id = %room.room_id, error = %err, "failed to delete stale room");
            }
        }

        let room = RoomDocument::new(Uuid::new_v4().to_string(), host, team);
        self.store.create_room(room.clone()).await?;
        info!(room_id = %room.room_id, host_id = %host.user_id, "room created");
        Ok(room)
    }

    /// Take the guest seat of `room_id`, or refresh the caller's team if already seated.
    pub async fn join_room(
        &self,
        room_id: &str,
        guest: &Identity,
        team: Option<Team>,
    ) -> Result<JoinOutcome, LobbyError> {
        if let Some(team) = &team {
            team.validate()?;
        }

        let room = self.load(room_id).await?;
        match room.seat_of(&guest.user_id) {
            Some(Seat::Host) => return Ok(JoinOutcome::AlreadySeated(Seat::Host)),
            Some(Seat::Guest) => {
                if let Some(team) = team {
                    self.store
                        .update_room(room_id, RoomUpdate::team_selected(Seat::Guest, team))
                        .await?;
                }
                return Ok(JoinOutcome::AlreadySeated(Seat::Guest));
            }
            None => {}
        }

        if !room.is_joinable() {
            debug!(room_id, user_id = %guest.user_id, "room not joinable");
            return Err(LobbyError::JoinConflict);
        }

        let update = RoomUpdate::guest_joined(guest, team).when(Precondition::GuestSeatOpen {
            user_id: guest.user_id.clone(),
        });
        match self.store.update_room(room_id, update).await {
            Ok(room) => {
                info!(room_id, user_id = %guest.user_id, "guest joined");
                Ok(JoinOutcome::Joined(room))
            }
            Err(err) if err.is_precondition_failed() => {
                debug!(room_id, user_id = %guest.user_id, error = %err, "lost the guest seat race");
                Err(LobbyError::JoinConflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the caller's team; the ready flag of that side is cleared in the same write.
    pub async fn select_team(
        &self,
        room_id: &str,
        seat: Seat,
        team: Team,
    ) -> Result<RoomDocument, LobbyError> {
        team.validate()?;
        Ok(self
            .store
            .update_room(room_id, RoomUpdate::team_selected(seat, team))
            .await?)
    }

    /// Leave the room according to the caller's seat.
    pub async fn leave_room(
        &self,
        room_id: &str,
        user: &Identity,
    ) -> Result<LeaveOutcome, LobbyError> {
        let room = match self.load(room_id).await {
            Ok(room) => room,
            Err(LobbyError::RoomMissing(_)) => return Ok(LeaveOutcome::Gone),
            Err(err) => return Err(err),
        };
        let Some(seat) = room.seat_of(&user.user_id) else {
            return Ok(LeaveOutcome::NotSeated);
        };

        if !room.status.is_open() {
            return self.presence_only(room_id, user).await;
        }

        // Both seats give way to a battle published between the read and the write.
        let (update, outcome) = match seat {
            Seat::Host => (
                RoomUpdate::status(RoomStatus::Finished).with_presence(&user.user_id, false),
                LeaveOutcome::RoomFinished,
            ),
            Seat::Guest => (
                RoomUpdate::guest_left(&user.user_id),
                LeaveOutcome::SeatReleased,
            ),
        };
        match self
            .store
            .update_room(room_id, update.when(Precondition::BattleUnassigned))
            .await
        {
            Ok(_) => {
                info!(room_id, user_id = %user.user_id, ?seat, ?outcome, "left room");
                Ok(outcome)
            }
            Err(err) if err.is_precondition_failed() => {
                debug!(room_id, ?seat, "battle assigned meanwhile; leaving seats untouched");
                self.presence_only(room_id, user).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn presence_only(
        &self,
        room_id: &str,
        user: &Identity,
    ) -> Result<LeaveOutcome, LobbyError> {
        self.store
            .update_room(room_id, RoomUpdate::presence(&user.user_id, false))
            .await?;
        Ok(LeaveOutcome::PresenceOnly)
    }

    /// Mark a lobby room finished. Host only; never touches a room with a battle.
    pub async fn finish_room(&self, room_id: &str, host: &Identity) -> Result<bool, LobbyError> {
        let room = self.load(room_id).await?;
        if room.host_id != host.user_id {
            return Err(LobbyError::NotHost);
        }
        if room.status == RoomStatus::Finished {
            return Ok(false);
        }

        let update = RoomUpdate::status(RoomStatus::Finished).when(Precondition::BattleUnassigned);
        match self.store.update_room(room_id, update).await {
            Ok(_) => {
                info!(room_id, "room finished");
                Ok(true)
            }
            Err(StorageError::PreconditionFailed { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the room document. Host only.
    pub async fn delete_room(&self, room_id: &str, host: &Identity) -> Result<(), LobbyError> {
        match self.load(room_id).await {
            Ok(room) if room.host_id != host.user_id => return Err(LobbyError::NotHost),
            Ok(_) => {}
            Err(LobbyError::RoomMissing(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.store.delete_room(room_id).await?;
        info!(room_id, "room deleted");
        Ok(())
    }

    /// Rooms a new guest could join, newest first.
    pub async fn list_joinable_rooms(&self) -> Result<Vec<RoomDocument>, LobbyError> {
        let mut rooms = self
            .store
            .list_rooms()
            .await?
            .into_iter()
            .filter(RoomDocument::is_joinable)
            .collect::<Vec<_>>();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rooms.truncate(LOBBY_PAGE_SIZE);
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use futures::{future::BoxFuture, stream::BoxStream};

    use super::*;
    use crate::{
        dao::{models::RoomEvent, room_store::InMemoryRoomStore, storage::StorageResult},
        dto::team::tests::{rival_team, starter_team, team},
    };

    fn host() -> Identity {
        Identity::new("h", "Red")
    }

    fn guest() -> Identity {
        Identity::new("g", "Blue")
    }

    fn service() -> (InMemoryRoomStore, RoomService) {
        let store = InMemoryRoomStore::new();
        (store.clone(), RoomService::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn create_replaces_stale_lobby_rooms() {
        let (store, rooms) = service();
        let first = rooms.create_room(&host(), None).await.unwrap();
        let second = rooms.create_room(&host(), Some(starter_team("t"))).await.unwrap();

        assert!(store.get_room(&first.room_id).await.unwrap().is_none());
        let stored = store.get_room(&second.room_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RoomStatus::Waiting);
        assert_eq!(stored.current_players, 1);
        assert_eq!(stored.max_players, 2);
    }

    #[tokio::test]
    async fn create_rejects_invalid_team() {
        let (_, rooms) = service();
        let err = rooms
            .create_room(&host(), Some(team("bad", vec![])))
            .await
            .unwrap_err();
        assert!(err.is_user_visible());
    }

    #[tokio::test]
    async fn join_is_exclusive() {
        let (_, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();

        let joined = rooms
            .join_room(&room.room_id, &guest(), Some(rival_team("t2")))
            .await
            .unwrap();
        assert!(matches!(joined, JoinOutcome::Joined(ref doc) if doc.current_players == 2));

        let again = rooms.join_room(&room.room_id, &guest(), None).await.unwrap();
        assert_eq!(again, JoinOutcome::AlreadySeated(Seat::Guest));

        let host_join = rooms.join_room(&room.room_id, &host(), None).await.unwrap();
        assert_eq!(host_join, JoinOutcome::AlreadySeated(Seat::Host));

        let err = rooms
            .join_room(&room.room_id, &Identity::new("x", "X"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::JoinConflict));
    }

    #[tokio::test]
    async fn guest_leave_reopens_the_room() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();
        rooms.join_room(&room.room_id, &guest(), None).await.unwrap();
        store
            .update_room(&room.room_id, RoomUpdate::ready(Seat::Host, true))
            .await
            .unwrap();

        let outcome = rooms.leave_room(&room.room_id, &guest()).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::SeatReleased);

        let doc = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(doc.guest(), None);
        assert_eq!(doc.current_players, 1);
        assert_eq!(doc.status, RoomStatus::Waiting);
        assert!(doc.host_ready);
        assert_eq!(rooms.list_joinable_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn host_leave_finishes_and_unlists() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();

        let outcome = rooms.leave_room(&room.room_id, &host()).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::RoomFinished);
        let doc = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(doc.status, RoomStatus::Finished);
        assert!(rooms.list_joinable_rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaving_a_battling_room_only_writes_presence() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();
        rooms.join_room(&room.room_id, &guest(), None).await.unwrap();
        store
            .update_room(&room.room_id, RoomUpdate::battle_started("b1"))
            .await
            .unwrap();

        let outcome = rooms.leave_room(&room.room_id, &guest()).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::PresenceOnly);
        let doc = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(doc.guest(), Some("g"));
        assert_eq!(doc.presence.get("g"), Some(&false));
    }

    /// Point reads answer with a stale copy taken before the latest writes.
    struct LaggingReads {
        inner: InMemoryRoomStore,
        stale: RoomDocument,
    }

    impl RoomStore for LaggingReads {
        fn create_room(&self, room: RoomDocument) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.create_room(room)
        }

        fn get_room(
            &self,
            _room_id: &str,
        ) -> BoxFuture<'static, StorageResult<Option<RoomDocument>>> {
            let stale = self.stale.clone();
            Box::pin(async move { Ok(Some(stale)) })
        }

        fn update_room(
            &self,
            room_id: &str,
            update: RoomUpdate,
        ) -> BoxFuture<'static, StorageResult<RoomDocument>> {
            self.inner.update_room(room_id, update)
        }

        fn delete_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.delete_room(room_id)
        }

        fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<RoomDocument>>> {
            self.inner.list_rooms()
        }

        fn subscribe(&self, room_id: &str) -> BoxStream<'static, StorageResult<RoomEvent>> {
            self.inner.subscribe(room_id)
        }
    }

    #[tokio::test]
    async fn guest_leave_racing_a_battle_keeps_the_battle() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();
        let joined = rooms.join_room(&room.room_id, &guest(), None).await.unwrap();
        let JoinOutcome::Joined(before_battle) = joined else {
            panic!("guest should take the seat");
        };
        store
            .update_room(&room.room_id, RoomUpdate::battle_started("b1"))
            .await
            .unwrap();

        let lagging = RoomService::new(Arc::new(LaggingReads {
            inner: store.clone(),
            stale: before_battle,
        }));
        let outcome = lagging.leave_room(&room.room_id, &guest()).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::PresenceOnly);

        let doc = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(doc.status, RoomStatus::Battling);
        assert_eq!(doc.battle(), Some("b1"));
        assert_eq!(doc.guest(), Some("g"));
        assert_eq!(doc.presence.get("g"), Some(&false));
    }

    #[tokio::test]
    async fn finish_never_overrides_a_battle() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();
        store
            .update_room(&room.room_id, RoomUpdate::battle_started("b1"))
            .await
            .unwrap();
        assert!(!rooms.finish_room(&room.room_id, &host()).await.unwrap());
        let doc = store.get_room(&room.room_id).await.unwrap().unwrap();
        assert_eq!(doc.status, RoomStatus::Battling);
    }

    #[tokio::test]
    async fn only_the_host_deletes() {
        let (store, rooms) = service();
        let room = rooms.create_room(&host(), None).await.unwrap();
        assert!(matches!(
            rooms.delete_room(&room.room_id, &guest()).await,
            Err(LobbyError::NotHost)
        ));
        rooms.delete_room(&room.room_id, &host()).await.unwrap();
        rooms.delete_room(&room.room_id, &host()).await.unwrap();
        assert!(store.get_room(&room.room_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_bounded() {
        let (_, rooms) = service();
        for n in 0..(LOBBY_PAGE_SIZE + 3) {
            rooms
                .create_room(&Identity::new(format!("h{n}"), "Host"), None)
                .await
                .unwrap();
        }
        let listed = rooms.list_joinable_rooms().await.unwrap();
        assert_eq!(listed.len(), LOBBY_PAGE_SIZE);
        assert!(
            listed
                .windows(2)
                .all(|pair| pair[0].created_at >= pair[1].created_at)
        );
    }
}
