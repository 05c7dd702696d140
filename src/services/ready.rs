use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use validator::Validate;

use crate::{
    dao::models::{RoomDocument, RoomStatus, RoomUpdate},
    dto::team::Team,
    error::LobbyError,
    services::room_service::RoomService,
    state::{RoomView, role::Identity},
};

/// What a ready toggle resolves to against a given snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyPlan {
    /// Write this update.
    Write(RoomUpdate),
    /// Take the open guest seat first.
    Join,
    /// The room is past the lobby; nothing to toggle.
    Ignore,
}

/// Result reported back to the caller of a ready toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// The seat's ready flag now holds `ready`.
    Applied {
        /// Value written to the seat.
        ready: bool,
    },
    /// The room is past the lobby; nothing changed.
    Ignored,
}

/// Resolve a ready toggle for `user_id` against `room`.
pub fn plan_ready(
    room: &RoomDocument,
    user_id: &str,
    ready: bool,
) -> Result<ReadyPlan, LobbyError> {
    if !room.status.is_open() {
        return Ok(ReadyPlan::Ignore);
    }

    let Some(seat) = room.seat_of(user_id) else {
        return if room.guest_seat_open() {
            Ok(ReadyPlan::Join)
        } else {
            Err(LobbyError::JoinConflict)
        };
    };

    if ready {
        let team = room
            .team(seat)
            .ok_or_else(|| LobbyError::TeamInvalid("select a team before getting ready".into()))?;
        team.validate()?;
    }

    let mut update = RoomUpdate::ready(seat, ready);
    let opponent_ready = room.is_ready(seat.opponent());
    if ready && opponent_ready && room.both_seats_filled() && room.status == RoomStatus::Waiting {
        update = update.with_status(RoomStatus::Ready);
    }
    Ok(ReadyPlan::Write(update))
}

/// Drives a ready toggle, performing the implicit join when the caller has no seat yet.
///
/// `view` is the session's live room view; after a join the negotiator waits for the settle
/// delay and then re-derives the caller's role from whatever the session has received.
pub struct ReadyNegotiator {
    rooms: RoomService,
    view: watch::Receiver<RoomView>,
    settle: Duration,
}

impl ReadyNegotiator {
    /// Negotiator reading seats from `view`.
    pub fn new(rooms: RoomService, view: watch::Receiver<RoomView>, settle: Duration) -> Self {
        Self {
            rooms,
            view,
            settle,
        }
    }

    fn latest(&self, room_id: &str) -> Result<RoomDocument, LobbyError> {
        self.view
            .borrow()
            .room()
            .cloned()
            .ok_or_else(|| LobbyError::RoomMissing(room_id.to_string()))
    }

    /// Join if needed, then write the ready flag.
    pub async fn set_ready(
        &self,
        room_id: &str,
        user: &Identity,
        preferred_team: Option<Team>,
        ready: bool,
    ) -> Result<ReadyOutcome, LobbyError> {
        let room = self.latest(room_id)?;
        let plan = match plan_ready(&room, &user.user_id, ready)? {
            ReadyPlan::Join => {
                info!(room_id, user_id = %user.user_id, "implicit join before ready toggle");
                self.rooms.join_room(room_id, user, preferred_team).await?;
                tokio::time::sleep(self.settle).await;

                let refreshed = self.latest(room_id)?;
                match plan_ready(&refreshed, &user.user_id, ready)? {
                    ReadyPlan::Join => {
                        debug!(room_id, user_id = %user.user_id, "join echo not seen yet");
                        return Err(LobbyError::NotReadyYet);
                    }
                    other => other,
                }
            }
            other => other,
        };

        match plan {
            ReadyPlan::Write(update) => {
                self.rooms.store().update_room(room_id, update).await?;
                debug!(room_id, user_id = %user.user_id, ready, "ready flag written");
                Ok(ReadyOutcome::Applied { ready })
            }
            ReadyPlan::Ignore | ReadyPlan::Join => Ok(ReadyOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;
    use crate::{
        dao::{
            models::RoomEvent,
            room_store::{InMemoryRoomStore, RoomStore},
        },
        dto::team::tests::{rival_team, starter_team},
        state::role::Seat,
    };

    fn host() -> Identity {
        Identity::new("h", "Red")
    }

    fn guest() -> Identity {
        Identity::new("g", "Blue")
    }

    fn seated_room() -> RoomDocument {
        let mut room = RoomDocument::new("r1", &host(), Some(starter_team("t1")));
        RoomUpdate::guest_joined(&guest(), Some(rival_team("t2"))).apply(&mut room);
        room
    }

    #[test]
    fn ready_requires_a_team() {
        let mut room = seated_room();
        room.guest_team = None;
        assert!(matches!(
            plan_ready(&room, "g", true),
            Err(LobbyError::TeamInvalid(_))
        ));
        assert!(plan_ready(&room, "g", false).is_ok());
    }

    #[test]
    fn second_ready_advances_status() {
        let mut room = seated_room();
        room.host_ready = true;
        let ReadyPlan::Write(update) = plan_ready(&room, "g", true).unwrap() else {
            panic!("expected a write");
        };
        assert_eq!(update.guest_ready, Some(true));
        assert_eq!(update.status, Some(RoomStatus::Ready));
    }

    #[test]
    fn first_ready_keeps_waiting() {
        let room = seated_room();
        let ReadyPlan::Write(update) = plan_ready(&room, "h", true).unwrap() else {
            panic!("expected a write");
        };
        assert_eq!(update.status, None);
    }

    #[test]
    fn observers_join_or_conflict() {
        let open = RoomDocument::new("r1", &host(), None);
        assert_eq!(plan_ready(&open, "g", true).unwrap(), ReadyPlan::Join);
        assert!(matches!(
            plan_ready(&seated_room(), "x", true),
            Err(LobbyError::JoinConflict)
        ));
    }

    #[test]
    fn battling_room_ignores_toggles() {
        let mut room = seated_room();
        RoomUpdate::battle_started("b1").apply(&mut room);
        assert_eq!(plan_ready(&room, "g", true).unwrap(), ReadyPlan::Ignore);
    }

    /// Mirror a room subscription into a watch channel like a session does.
    async fn follow(store: &InMemoryRoomStore, room_id: &str) -> watch::Receiver<RoomView> {
        let (tx, mut rx) = watch::channel(RoomView::default());
        let mut stream = store.subscribe(room_id);
        tokio::spawn(async move {
            while let Some(Ok(event)) = stream.next().await {
                let room = match event {
                    RoomEvent::Snapshot(doc) => Some(doc),
                    RoomEvent::Absent => None,
                };
                if tx.send(RoomView::from_delivery(room)).is_err() {
                    break;
                }
            }
        });
        rx.wait_for(RoomView::is_initialized).await.unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn implicit_join_then_ready() {
        let store = InMemoryRoomStore::new();
        store
            .create_room(RoomDocument::new("r1", &host(), Some(starter_team("t1"))))
            .await
            .unwrap();
        let view = follow(&store, "r1").await;
        let negotiator = ReadyNegotiator::new(
            RoomService::new(Arc::new(store.clone())),
            view,
            Duration::from_millis(200),
        );

        let outcome = negotiator
            .set_ready("r1", &guest(), Some(rival_team("t2")), true)
            .await
            .unwrap();
        assert_eq!(outcome, ReadyOutcome::Applied { ready: true });

        let room = store.get_room("r1").await.unwrap().unwrap();
        assert_eq!(room.seat_of("g"), Some(Seat::Guest));
        assert!(room.guest_ready);
        assert_eq!(room.guest_team.unwrap().id, "t2");
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_seat_race_is_a_join_conflict() {
        let store = InMemoryRoomStore::new();
        store
            .create_room(RoomDocument::new("r1", &host(), None))
            .await
            .unwrap();
        let view = follow(&store, "r1").await;
        let negotiator = ReadyNegotiator::new(
            RoomService::new(Arc::new(store.clone())),
            view,
            Duration::from_millis(200),
        );

        // Someone else takes the seat after our cached view was taken.
        store
            .update_room("r1", RoomUpdate::guest_joined(&Identity::new("x", "X"), None))
            .await
            .unwrap();
        let err = negotiator
            .set_ready("r1", &guest(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::JoinConflict));
    }
}
