//! Per-client session controller: one task owning the room view, the derived role and the
//! hand-off guard of a single user in a single room.

use std::{future, sync::Arc};

use futures::{StreamExt, stream::BoxStream};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    dao::{models::RoomEvent, storage::StorageResult},
    dto::{
        events::SessionEvent,
        handoff::HandoffParams,
        team::{ReleasedTeam, Team},
    },
    error::LobbyError,
    services::{
        battle_coordinator::{BattleCoordinator, check_start_preconditions, handoff_target},
        forfeit::ForfeitDetector,
        presence::PresenceTracker,
        ready::{ReadyNegotiator, ReadyOutcome},
        release::ReleaseSync,
        room_service::{LeaveOutcome, RoomService},
    },
    state::{
        EventHub, HandoffEvent, HandoffPhase, HandoffStateMachine, RoomView, SharedContext,
        Snapshot,
        role::{Identity, Role, Seat},
        transitions::apply_with_broadcast,
    },
};

const COMMAND_CAPACITY: usize = 16;

/// Reply of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The battle was created and published.
    Started {
        /// Identifier written to the room.
        battle_id: String,
    },
    /// A start is already in flight; this request did nothing.
    AlreadyInProgress,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Control passed to the battle runtime.
    HandedOff(HandoffParams),
    /// The user left or deleted the room.
    Left,
    /// The session was closed (or its handle dropped).
    Closed,
    /// The room disappeared outside a hand-off.
    RoomMissing,
    /// The session could not continue.
    Aborted(String),
}

type Reply<T> = oneshot::Sender<Result<T, LobbyError>>;

enum SessionCommand {
    SelectTeam { team: Team, reply: Reply<()> },
    SetReady { ready: bool, reply: Reply<ReadyOutcome> },
    StartBattle { reply: Reply<StartOutcome> },
    EnterBattle { reply: Reply<HandoffParams> },
    ReleaseBall { slot: u8, reply: Reply<()> },
    ReleaseTeam { team: ReleasedTeam, reply: Reply<()> },
    Leave { reply: Reply<LeaveOutcome> },
    DeleteRoom { reply: Reply<()> },
    Close,
}

/// Results of network effects run off the session task.
enum Completion {
    StartFinished {
        attempt: u64,
        result: Result<String, LobbyError>,
    },
}

/// Client-side handle to a running session.
pub struct SessionHandle {
    room_id: String,
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<RoomView>,
    guard: watch::Receiver<Snapshot>,
    events: Arc<EventHub>,
    task: JoinHandle<SessionExit>,
}

impl SessionHandle {
    /// Room this session follows.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Latest accepted room view.
    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    /// Current hand-off guard snapshot.
    pub fn guard(&self) -> Snapshot {
        self.guard.borrow().clone()
    }

    /// Listen to session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the room view satisfies `predicate`; returns the matching view.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&RoomView) -> bool,
    ) -> Result<RoomView, LobbyError> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(predicate)
            .await
            .map_err(|_| LobbyError::SessionClosed)?;
        Ok(matched.clone())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, LobbyError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| LobbyError::SessionClosed)?;
        rx.await.map_err(|_| LobbyError::SessionClosed)?
    }

    /// Pick a team. Without a seat it is kept for the implicit join.
    pub async fn select_team(&self, team: Team) -> Result<(), LobbyError> {
        self.request(|reply| SessionCommand::SelectTeam { team, reply })
            .await
    }

    /// Toggle the caller's ready flag, joining the open guest seat first if needed.
    pub async fn set_ready(&self, ready: bool) -> Result<ReadyOutcome, LobbyError> {
        self.request(|reply| SessionCommand::SetReady { ready, reply })
            .await
    }

    /// Host only. Resolves once the battle id is published.
    pub async fn start_battle(&self) -> Result<StartOutcome, LobbyError> {
        self.request(|reply| SessionCommand::StartBattle { reply })
            .await
    }

    /// Explicit "enter battle"; fails with [`LobbyError::NotReadyYet`] until an id exists.
    pub async fn enter_battle(&self) -> Result<HandoffParams, LobbyError> {
        self.request(|reply| SessionCommand::EnterBattle { reply })
            .await
    }

    /// Animate and release the ball in `slot`. Participants only.
    pub async fn release_ball(&self, slot: u8) -> Result<(), LobbyError> {
        self.request(|reply| SessionCommand::ReleaseBall { slot, reply })
            .await
    }

    /// Publish the released team for the caller's seat. Participants only.
    pub async fn release_team(&self, team: ReleasedTeam) -> Result<(), LobbyError> {
        self.request(|reply| SessionCommand::ReleaseTeam { team, reply })
            .await
    }

    /// Leave the room according to the caller's seat; ends the session on success.
    pub async fn leave(&self) -> Result<LeaveOutcome, LobbyError> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }

    /// Host only.
    pub async fn delete_room(&self) -> Result<(), LobbyError> {
        self.request(|reply| SessionCommand::DeleteRoom { reply })
            .await
    }

    /// Close the session and wait for its teardown.
    pub async fn close(self) -> SessionExit {
        let _ = self.commands.send(SessionCommand::Close).await;
        self.wait().await
    }

    /// Wait for the session to end on its own.
    pub async fn wait(self) -> SessionExit {
        let SessionHandle { commands, task, .. } = self;
        let exit = match task.await {
            Ok(exit) => exit,
            Err(err) => SessionExit::Aborted(err.to_string()),
        };
        drop(commands);
        exit
    }
}

/// Start a session for `user` in `room_id`.
pub fn spawn_session(
    ctx: SharedContext,
    room_id: impl Into<String>,
    user: Identity,
) -> SessionHandle {
    let room_id = room_id.into();
    let config = ctx.config().clone();
    let store = ctx.store();

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (completions_tx, completions_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (view_tx, view_rx) = watch::channel(RoomView::default());
    let guard = HandoffStateMachine::new();
    let (guard_tx, guard_rx) = watch::channel(guard.snapshot());
    let events = Arc::new(EventHub::new(config.event_capacity));

    let session = Session {
        room_id: room_id.clone(),
        presence: PresenceTracker::new(
            store.clone(),
            room_id.clone(),
            user.user_id.clone(),
            config.timings.presence_debounce,
        ),
        rooms: RoomService::new(store.clone()),
        coordinator: BattleCoordinator::new(store.clone(), ctx.battles(), ctx.mirror()),
        ctx,
        user,
        view_tx,
        guard_tx,
        events: events.clone(),
        guard,
        forfeit: ForfeitDetector::new(),
        role: Role::Observer,
        preferred_team: None,
        pending_start: None,
        start_attempt: 0,
        completions: completions_tx,
        tasks: JoinSet::new(),
    };

    let stream = store.subscribe(&room_id);
    let task = tokio::spawn(session.run(stream, commands_rx, completions_rx));

    SessionHandle {
        room_id,
        commands: commands_tx,
        view: view_rx,
        guard: guard_rx,
        events,
        task,
    }
}

struct Session {
    ctx: SharedContext,
    room_id: String,
    user: Identity,
    view_tx: watch::Sender<RoomView>,
    guard_tx: watch::Sender<Snapshot>,
    events: Arc<EventHub>,
    guard: HandoffStateMachine,
    presence: PresenceTracker,
    forfeit: ForfeitDetector,
    rooms: RoomService,
    coordinator: BattleCoordinator,
    /// Role derived from the latest snapshot.
    role: Role,
    preferred_team: Option<Team>,
    pending_start: Option<Reply<StartOutcome>>,
    /// Bumped on every start so late completions of an expired attempt are ignored.
    start_attempt: u64,
    completions: mpsc::Sender<Completion>,
    /// Cosmetic and negotiation tasks; aborted when the session ends.
    tasks: JoinSet<()>,
}

impl Session {
    async fn run(
        mut self,
        mut stream: BoxStream<'static, StorageResult<RoomEvent>>,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut completions: mpsc::Receiver<Completion>,
    ) -> SessionExit {
        info!(room_id = %self.room_id, user_id = %self.user.user_id, "session started");

        let exit = loop {
            let deadline = self.guard.next_deadline();
            tokio::select! {
                delivery = stream.next() => match delivery {
                    Some(Ok(event)) => {
                        if let Some(exit) = self.on_delivery(event) {
                            break exit;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(room_id = %self.room_id, error = %err, "room subscription error");
                    }
                    None => break SessionExit::Aborted("room subscription ended".into()),
                },
                command = commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break self.close().await,
                    Some(command) => {
                        if let Some(exit) = self.on_command(command).await {
                            break exit;
                        }
                    }
                },
                Some(done) = completions.recv() => {
                    if let Some(exit) = self.on_completion(done) {
                        break exit;
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    if let Some(exit) = self.on_deadline() {
                        break exit;
                    }
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        };

        drop(stream);
        self.presence.cancel();
        self.tasks.abort_all();
        info!(room_id = %self.room_id, user_id = %self.user.user_id, exit = ?exit, "session ended");
        exit
    }

    fn view(&self) -> RoomView {
        self.view_tx.borrow().clone()
    }

    fn transition(&mut self, event: HandoffEvent) -> Result<HandoffPhase, LobbyError> {
        let next = apply_with_broadcast(&mut self.guard, &self.events, &self.room_id, event)?;
        self.guard_tx.send_replace(self.guard.snapshot());
        Ok(next)
    }

    /// Surface a failed action to listeners according to its class.
    fn report(events: &EventHub, room_id: &str, err: &LobbyError) {
        match err {
            LobbyError::JoinConflict => debug!(room_id, "join conflict ignored"),
            err if err.is_user_visible() => {
                warn!(room_id, error = %err, "action failed");
                events.broadcast(SessionEvent::ActionFailed {
                    message: err.to_string(),
                });
            }
            err => warn!(room_id, error = %err, "action failed"),
        }
    }

    fn on_delivery(&mut self, event: RoomEvent) -> Option<SessionExit> {
        let next = RoomView::from_delivery(match event {
            RoomEvent::Snapshot(doc) => Some(doc),
            RoomEvent::Absent => None,
        });
        let previous = self.view();
        if previous.is_same_as(&next) {
            debug!(room_id = %self.room_id, "identical snapshot dropped");
            return None;
        }
        self.view_tx.send_replace(next.clone());

        let Some(room) = next.room() else {
            return self.on_room_missing();
        };

        self.role = room.role_of(&self.user.user_id);
        self.events.broadcast(SessionEvent::RoomUpdated(room.clone()));

        if let Some(params) = handoff_target(room, &self.user) {
            return Some(self.hand_off(params));
        }

        // No-op once registered; a failed write is retried here on the next snapshot.
        if self.role.is_participant() {
            self.presence.mark_present(self.role);
        }

        if let Some(signal) = self.forfeit.observe(
            previous.room(),
            room,
            self.role,
            self.guard.suppresses_cleanup(),
        ) {
            info!(
                room_id = %self.room_id,
                room_finished = signal.room_finished,
                "opponent forfeited"
            );
            self.events.broadcast(SessionEvent::OpponentForfeited(signal));
        }
        None
    }

    fn on_room_missing(&mut self) -> Option<SessionExit> {
        if self.guard.suppresses_cleanup() {
            debug!(room_id = %self.room_id, "room missing during hand-off; deferring");
            return None;
        }
        info!(room_id = %self.room_id, "room missing");
        self.events.broadcast(SessionEvent::RoomMissing {
            room_id: self.room_id.clone(),
        });
        Some(SessionExit::RoomMissing)
    }

    fn hand_off(&mut self, params: HandoffParams) -> SessionExit {
        if let Err(err) = self.transition(HandoffEvent::HandOff {
            battle_id: params.battle_id.clone(),
        }) {
            debug!(room_id = %self.room_id, error = %err, "hand-off transition rejected");
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Ok(StartOutcome::Started {
                battle_id: params.battle_id.clone(),
            }));
        }
        info!(
            room_id = %self.room_id,
            battle_id = %params.battle_id,
            role = ?params.role,
            "handing off to battle"
        );
        self.events.broadcast(SessionEvent::HandedOff(params.clone()));
        SessionExit::HandedOff(params)
    }

    fn host_params(&self, battle_id: &str) -> HandoffParams {
        HandoffParams::new(
            self.room_id.clone(),
            battle_id,
            Seat::Host,
            self.user.user_id.clone(),
            self.user.display_name.clone(),
        )
    }

    async fn on_command(&mut self, command: SessionCommand) -> Option<SessionExit> {
        match command {
            SessionCommand::SelectTeam { team, reply } => {
                self.select_team(team, reply);
                None
            }
            SessionCommand::SetReady { ready, reply } => {
                self.set_ready(ready, reply);
                None
            }
            SessionCommand::StartBattle { reply } => {
                self.start_battle(reply);
                None
            }
            SessionCommand::EnterBattle { reply } => self.enter_battle(reply),
            SessionCommand::ReleaseBall { slot, reply } => {
                self.release(reply, move |sync| async move { sync.release_ball(slot).await });
                None
            }
            SessionCommand::ReleaseTeam { team, reply } => {
                self.release(reply, move |sync| async move { sync.release_team(team).await });
                None
            }
            SessionCommand::Leave { reply } => self.leave(reply).await,
            SessionCommand::DeleteRoom { reply } => self.delete_room(reply).await,
            SessionCommand::Close => Some(self.close().await),
        }
    }

    fn select_team(&mut self, team: Team, reply: Reply<()>) {
        if !self.guard.is_idle() {
            let _ = reply.send(Err(LobbyError::HandoffInProgress));
            return;
        }
        if let Err(err) = team.validate() {
            let err = LobbyError::from(err);
            Self::report(&self.events, &self.room_id, &err);
            let _ = reply.send(Err(err));
            return;
        }

        self.preferred_team = Some(team.clone());
        let Some(seat) = self.role.seat() else {
            debug!(room_id = %self.room_id, "team kept for implicit join");
            let _ = reply.send(Ok(()));
            return;
        };

        let rooms = self.rooms.clone();
        let events = self.events.clone();
        let room_id = self.room_id.clone();
        self.tasks.spawn(async move {
            let result = rooms.select_team(&room_id, seat, team).await.map(|_| ());
            if let Err(err) = &result {
                Self::report(&events, &room_id, err);
            }
            let _ = reply.send(result);
        });
    }

    fn set_ready(&mut self, ready: bool, reply: Reply<ReadyOutcome>) {
        if !self.guard.is_idle() {
            let _ = reply.send(Err(LobbyError::HandoffInProgress));
            return;
        }

        let negotiator = ReadyNegotiator::new(
            self.rooms.clone(),
            self.view_tx.subscribe(),
            self.ctx.config().timings.join_settle,
        );
        let user = self.user.clone();
        let preferred = self.preferred_team.clone();
        let events = self.events.clone();
        let room_id = self.room_id.clone();
        self.tasks.spawn(async move {
            let result = negotiator.set_ready(&room_id, &user, preferred, ready).await;
            if let Err(err) = &result {
                Self::report(&events, &room_id, err);
            }
            let _ = reply.send(result);
        });
    }

    fn start_battle(&mut self, reply: Reply<StartOutcome>) {
        if !self.guard.is_idle() {
            debug!(room_id = %self.room_id, "start already in progress");
            let _ = reply.send(Ok(StartOutcome::AlreadyInProgress));
            return;
        }

        let request = match self.view().room() {
            Some(room) => check_start_preconditions(room, &self.user.user_id),
            None => Err(LobbyError::RoomMissing(self.room_id.clone())),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                Self::report(&self.events, &self.room_id, &err);
                let _ = reply.send(Err(err));
                return;
            }
        };

        let grace_until = Instant::now() + self.ctx.config().timings.battle_grace;
        if let Err(err) = self.transition(HandoffEvent::BeginStart { grace_until }) {
            let _ = reply.send(Err(err));
            return;
        }
        self.pending_start = Some(reply);
        self.start_attempt += 1;

        // Detached: a created battle is still published after the session ends.
        let attempt = self.start_attempt;
        let coordinator = self.coordinator.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = coordinator.create_and_publish(request).await;
            let _ = completions
                .send(Completion::StartFinished { attempt, result })
                .await;
        });
    }

    fn enter_battle(&mut self, reply: Reply<HandoffParams>) -> Option<SessionExit> {
        let target = self
            .view()
            .room()
            .and_then(|room| handoff_target(room, &self.user))
            .or_else(|| match self.guard.phase() {
                HandoffPhase::Grace { battle_id, .. } => Some(self.host_params(battle_id)),
                _ => None,
            });

        match target {
            Some(params) => {
                let _ = reply.send(Ok(params.clone()));
                Some(self.hand_off(params))
            }
            None => {
                debug!(room_id = %self.room_id, "enter requested before battle id");
                let _ = reply.send(Err(LobbyError::NotReadyYet));
                None
            }
        }
    }

    fn release<F, Fut>(&mut self, reply: Reply<()>, work: F)
    where
        F: FnOnce(ReleaseSync) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), LobbyError>> + Send + 'static,
    {
        let Some(seat) = self.role.seat() else {
            let _ = reply.send(Err(LobbyError::NotParticipant));
            return;
        };
        let sync = ReleaseSync::new(
            self.ctx.store(),
            self.room_id.clone(),
            seat,
            self.ctx.config().timings.release_animation,
        );
        let room_id = self.room_id.clone();
        self.tasks.spawn(async move {
            let result = work(sync).await;
            if let Err(err) = &result {
                debug!(room_id = %room_id, error = %err, "release sync failed");
            }
            let _ = reply.send(result);
        });
    }

    async fn leave(&mut self, reply: Reply<LeaveOutcome>) -> Option<SessionExit> {
        if self.guard.suppresses_cleanup() {
            let _ = reply.send(Err(LobbyError::HandoffInProgress));
            return None;
        }
        match self.rooms.leave_room(&self.room_id, &self.user).await {
            Ok(outcome) => {
                self.presence.cancel();
                let _ = reply.send(Ok(outcome));
                Some(SessionExit::Left)
            }
            Err(err) => {
                Self::report(&self.events, &self.room_id, &err);
                let _ = reply.send(Err(err));
                None
            }
        }
    }

    async fn delete_room(&mut self, reply: Reply<()>) -> Option<SessionExit> {
        if self.guard.suppresses_cleanup() {
            let _ = reply.send(Err(LobbyError::HandoffInProgress));
            return None;
        }
        match self.rooms.delete_room(&self.room_id, &self.user).await {
            Ok(()) => {
                self.presence.cancel();
                let _ = reply.send(Ok(()));
                Some(SessionExit::Left)
            }
            Err(err) => {
                let _ = reply.send(Err(err));
                None
            }
        }
    }

    /// Teardown on close: absent presence and, for the host of a lobby room, finish it.
    async fn close(&mut self) -> SessionExit {
        if self.guard.suppresses_cleanup() {
            debug!(room_id = %self.room_id, "close during hand-off; cleanup suppressed");
            self.presence.cancel();
            return SessionExit::Closed;
        }

        self.presence.flush_absent(self.role).await;

        let lobby_open = self
            .view()
            .room()
            .is_some_and(|room| room.status.is_open());
        if self.role == Role::Host && lobby_open {
            if let Err(err) = self.rooms.finish_room(&self.room_id, &self.user).await {
                warn!(room_id = %self.room_id, error = %err, "failed to finish room on close");
            }
        }
        SessionExit::Closed
    }

    fn on_completion(&mut self, done: Completion) -> Option<SessionExit> {
        let Completion::StartFinished { attempt, result } = done;
        let current = attempt == self.start_attempt
            && matches!(self.guard.phase(), HandoffPhase::Starting { .. });
        if !current {
            debug!(room_id = %self.room_id, attempt, ok = result.is_ok(), "stale start completion ignored");
            return None;
        }

        match result {
            Ok(battle_id) => {
                let fallback_at = Instant::now() + self.ctx.config().timings.auto_enter_fallback;
                if let Err(err) = self.transition(HandoffEvent::CreationPublished {
                    battle_id: battle_id.clone(),
                    fallback_at,
                }) {
                    warn!(room_id = %self.room_id, error = %err, "unexpected guard state");
                }
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(StartOutcome::Started { battle_id }));
                }
                None
            }
            Err(err) => {
                let _ = self.transition(HandoffEvent::CreationFailed);
                Self::report(&self.events, &self.room_id, &err);
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Err(err));
                }
                if self.view().is_absent() {
                    return self.on_room_missing();
                }
                None
            }
        }
    }

    fn on_deadline(&mut self) -> Option<SessionExit> {
        let (battle_id, grace_until, fallback_at) = match self.guard.phase().clone() {
            HandoffPhase::Grace {
                battle_id,
                grace_until,
                fallback_at,
            } => (battle_id, grace_until, fallback_at),
            HandoffPhase::Starting { grace_until } if Instant::now() >= grace_until => {
                return self.on_start_timeout();
            }
            _ => return None,
        };

        let now = Instant::now();
        let room_present = self.view().room().is_some();
        if now >= fallback_at && room_present {
            info!(room_id = %self.room_id, battle_id = %battle_id, "no echo; forcing hand-off");
            let params = self.host_params(&battle_id);
            return Some(self.hand_off(params));
        }
        if now >= grace_until || !room_present {
            if let Err(err) = self.transition(HandoffEvent::GraceExpired) {
                warn!(room_id = %self.room_id, error = %err, "grace expiry rejected");
            }
            if self.view().is_absent() {
                return self.on_room_missing();
            }
        }
        None
    }

    /// The battle service outlived the grace window: release the guard and fail the start.
    fn on_start_timeout(&mut self) -> Option<SessionExit> {
        if let Err(err) = self.transition(HandoffEvent::GraceExpired) {
            warn!(room_id = %self.room_id, error = %err, "start expiry rejected");
        }
        let err =
            LobbyError::BattleCreationFailed("no battle published within the grace window".into());
        Self::report(&self.events, &self.room_id, &err);
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(err));
        }
        if self.view().is_absent() {
            return self.on_room_missing();
        }
        None
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{
            battle::{InMemoryBattleMirror, InMemoryBattleService},
            models::{RoomDocument, RoomStatus, RoomUpdate},
            room_store::{InMemoryRoomStore, RoomStore},
        },
        dto::team::tests::{rival_team, starter_team},
        state::LobbyContext,
    };

    /// Hides every snapshot that carries a battle id from subscribers.
    #[derive(Clone)]
    struct MutedStore(InMemoryRoomStore);

    impl RoomStore for MutedStore {
        fn create_room(&self, room: RoomDocument) -> BoxFuture<'static, StorageResult<()>> {
            self.0.create_room(room)
        }

        fn get_room(
            &self,
            room_id: &str,
        ) -> BoxFuture<'static, StorageResult<Option<RoomDocument>>> {
            self.0.get_room(room_id)
        }

        fn update_room(
            &self,
            room_id: &str,
            update: RoomUpdate,
        ) -> BoxFuture<'static, StorageResult<RoomDocument>> {
            self.0.update_room(room_id, update)
        }

        fn delete_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<()>> {
            self.0.delete_room(room_id)
        }

        fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<RoomDocument>>> {
            self.0.list_rooms()
        }

        fn subscribe(&self, room_id: &str) -> BoxStream<'static, StorageResult<RoomEvent>> {
            self.0
                .subscribe(room_id)
                .filter(|event| {
                    let visible = !matches!(
                        event,
                        Ok(RoomEvent::Snapshot(room)) if room.battle().is_some()
                    );
                    future::ready(visible)
                })
                .boxed()
        }
    }

    fn host() -> Identity {
        Identity::new("h", "Red")
    }

    fn guest() -> Identity {
        Identity::new("g", "Blue")
    }

    fn context(store: Arc<dyn RoomStore>, battles: &InMemoryBattleService) -> SharedContext {
        LobbyContext::new(
            store,
            Arc::new(battles.clone()),
            Arc::new(InMemoryBattleMirror::new()),
            AppConfig::default(),
        )
    }

    async fn open_room(ctx: &SharedContext) -> String {
        RoomService::new(ctx.store())
            .create_room(&host(), Some(starter_team("t1")))
            .await
            .unwrap()
            .room_id
    }

    /// Host and guest sessions with both players seated and ready.
    async fn ready_pair(ctx: &SharedContext) -> (String, SessionHandle, SessionHandle) {
        let room_id = open_room(ctx).await;
        let host_session = spawn_session(ctx.clone(), &room_id, host());
        let guest_session = spawn_session(ctx.clone(), &room_id, guest());
        host_session.wait_for(RoomView::is_initialized).await.unwrap();
        guest_session.wait_for(RoomView::is_initialized).await.unwrap();

        guest_session.select_team(rival_team("t2")).await.unwrap();
        assert_eq!(
            guest_session.set_ready(true).await.unwrap(),
            ReadyOutcome::Applied { ready: true }
        );
        host_session
            .wait_for(|view| view.room().is_some_and(|room| room.guest_ready))
            .await
            .unwrap();
        host_session.set_ready(true).await.unwrap();
        host_session
            .wait_for(|view| {
                view.room()
                    .is_some_and(|room| room.host_ready && room.status == RoomStatus::Ready)
            })
            .await
            .unwrap();
        (room_id, host_session, guest_session)
    }

    #[tokio::test(start_paused = true)]
    async fn both_players_hand_off_to_the_same_battle() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let (room_id, host_session, guest_session) = ready_pair(&ctx).await;

        let StartOutcome::Started { battle_id } = host_session.start_battle().await.unwrap()
        else {
            panic!("start should publish a battle");
        };

        let SessionExit::HandedOff(host_params) = host_session.wait().await else {
            panic!("host should hand off");
        };
        let SessionExit::HandedOff(guest_params) = guest_session.wait().await else {
            panic!("guest should hand off");
        };

        assert_eq!(host_params.battle_id, battle_id);
        assert_eq!(guest_params.battle_id, battle_id);
        assert!(host_params.is_host);
        assert_eq!(guest_params.role, Seat::Guest);
        assert_eq!(guest_params.user_name, "Blue");
        assert_eq!(battles.created(), 1);
        assert_eq!(store.subscriber_count(&room_id), 0);

        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Battling);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_creates_one_battle() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new().with_latency(Duration::from_millis(500));
        let ctx = context(Arc::new(store.clone()), &battles);
        let (_, host_session, guest_session) = ready_pair(&ctx).await;

        let (first, second) = tokio::join!(host_session.start_battle(), host_session.start_battle());
        let outcomes = [first.unwrap(), second.unwrap()];
        assert!(outcomes.contains(&StartOutcome::AlreadyInProgress));
        assert!(
            outcomes
                .iter()
                .any(|outcome| matches!(outcome, StartOutcome::Started { .. }))
        );

        assert!(matches!(host_session.wait().await, SessionExit::HandedOff(_)));
        assert!(matches!(guest_session.wait().await, SessionExit::HandedOff(_)));
        assert_eq!(battles.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_cannot_enter_before_battle_id() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let (_, host_session, guest_session) = ready_pair(&ctx).await;

        assert!(matches!(
            guest_session.enter_battle().await,
            Err(LobbyError::NotReadyYet)
        ));

        host_session.start_battle().await.unwrap();
        assert!(matches!(guest_session.wait().await, SessionExit::HandedOff(_)));
        assert!(matches!(host_session.wait().await, SessionExit::HandedOff(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_resets_guard_and_reports() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        battles.reject_next(1);
        let ctx = context(Arc::new(store.clone()), &battles);
        let (room_id, host_session, guest_session) = ready_pair(&ctx).await;
        let mut events = host_session.subscribe();

        let err = host_session.start_battle().await.unwrap_err();
        assert!(matches!(err, LobbyError::BattleCreationFailed(_)));
        assert_eq!(host_session.guard().phase, HandoffPhase::Idle);
        loop {
            if let SessionEvent::ActionFailed { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert!(room.battle().is_none());

        assert!(matches!(
            host_session.start_battle().await.unwrap(),
            StartOutcome::Started { .. }
        ));
        assert!(matches!(host_session.wait().await, SessionExit::HandedOff(_)));
        assert!(matches!(guest_session.wait().await, SessionExit::HandedOff(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn host_falls_back_when_echo_never_arrives() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(MutedStore(store.clone())), &battles);
        let (_, host_session, guest_session) = ready_pair(&ctx).await;

        let StartOutcome::Started { battle_id } = host_session.start_battle().await.unwrap()
        else {
            panic!("start should publish a battle");
        };
        assert!(matches!(
            host_session.guard().phase,
            HandoffPhase::Grace { .. }
        ));

        let published = Instant::now();
        let SessionExit::HandedOff(params) = host_session.wait().await else {
            panic!("host should hand off after the fallback");
        };
        assert!(published.elapsed() >= Duration::from_secs(2));
        assert_eq!(params.battle_id, battle_id);
        assert!(params.is_host);

        assert_eq!(guest_session.close().await, SessionExit::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn host_close_finishes_room() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let room_id = open_room(&ctx).await;

        let session = spawn_session(ctx.clone(), &room_id, host());
        session.wait_for(RoomView::is_initialized).await.unwrap();
        assert_eq!(session.close().await, SessionExit::Closed);

        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Finished);
        assert!(
            RoomService::new(ctx.store())
                .list_joinable_rooms()
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.subscriber_count(&room_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_closes_session() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let room_id = open_room(&ctx).await;

        let session = spawn_session(ctx.clone(), &room_id, host());
        session.wait_for(RoomView::is_initialized).await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Finished);
        assert_eq!(store.subscriber_count(&room_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_room_ends_session() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let room_id = open_room(&ctx).await;

        let session = spawn_session(ctx.clone(), &room_id, guest());
        session.wait_for(RoomView::is_initialized).await.unwrap();
        RoomService::new(ctx.store())
            .delete_room(&room_id, &host())
            .await
            .unwrap();

        assert_eq!(session.wait().await, SessionExit::RoomMissing);
        assert_eq!(store.subscriber_count(&room_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_leaving_is_reported_to_host() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let (room_id, host_session, guest_session) = ready_pair(&ctx).await;
        let mut events = host_session.subscribe();

        assert_eq!(guest_session.leave().await.unwrap(), LeaveOutcome::SeatReleased);
        assert_eq!(guest_session.wait().await, SessionExit::Left);

        let signal = loop {
            if let SessionEvent::OpponentForfeited(signal) = events.recv().await.unwrap() {
                break signal;
            }
        };
        assert!(!signal.room_finished);
        assert_eq!(signal.opponent_name.as_deref(), Some("Blue"));

        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert!(room.guest().is_none());
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(host_session.close().await, SessionExit::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_presence_write_is_retried_on_next_snapshot() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let room_id = open_room(&ctx).await;
        store
            .update_room(&room_id, RoomUpdate::presence("h", false))
            .await
            .unwrap();
        store.fail_next_writes(1);

        let session = spawn_session(ctx.clone(), &room_id, host());
        session.wait_for(RoomView::is_initialized).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.presence.get("h"), Some(&false));

        store
            .update_room(&room_id, RoomUpdate::ready(Seat::Host, true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.presence.get("h"), Some(&true));
        assert_eq!(session.close().await, SessionExit::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_creation_releases_guard_after_grace() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new().with_latency(Duration::from_secs(60));
        let ctx = context(Arc::new(store.clone()), &battles);
        let (room_id, host_session, guest_session) = ready_pair(&ctx).await;

        let started = Instant::now();
        let err = host_session.start_battle().await.unwrap_err();
        assert!(matches!(err, LobbyError::BattleCreationFailed(_)));
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(host_session.guard().phase, HandoffPhase::Idle);

        assert_eq!(host_session.close().await, SessionExit::Closed);
        let room = store.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Finished);
        assert!(room.battle().is_none());
        assert_eq!(guest_session.close().await, SessionExit::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_release_is_rejected() {
        let store = InMemoryRoomStore::new();
        let battles = InMemoryBattleService::new();
        let ctx = context(Arc::new(store.clone()), &battles);
        let room_id = open_room(&ctx).await;

        let session = spawn_session(ctx.clone(), &room_id, guest());
        session.wait_for(RoomView::is_initialized).await.unwrap();
        assert!(matches!(
            session.release_ball(0).await,
            Err(LobbyError::NotParticipant)
        ));
        assert!(matches!(session.start_battle().await, Err(LobbyError::NotHost)));
        assert_eq!(session.close().await, SessionExit::Closed);
    }
}
