use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    dto::team::{ReleasedTeam, Team},
    state::role::{Identity, Role, Seat},
};

/// Capacity of every room: one host and one guest.
pub const MAX_PLAYERS: u8 = 2;

/// Lifecycle status of a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Ready,
    Battling,
    Finished,
}

impl RoomStatus {
    /// Whether new guests may still join.
    pub fn is_open(self) -> bool {
        matches!(self, RoomStatus::Waiting | RoomStatus::Ready)
    }
}

/// The replicated room document exactly as it travels between clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDocument {
    pub room_id: String,
    pub host_id: String,
    pub host_name: String,
    #[serde(default)]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub host_ready: bool,
    #[serde(default)]
    pub guest_ready: bool,
    #[serde(default)]
    pub host_team: Option<Team>,
    #[serde(default)]
    pub guest_team: Option<Team>,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub battle_id: Option<String>,
    pub current_players: u8,
    #[serde(default = "default_max_players")]
    pub max_players: u8,
    #[serde(default)]
    pub host_animating_balls: BTreeSet<u8>,
    #[serde(default)]
    pub guest_animating_balls: BTreeSet<u8>,
    #[serde(default)]
    pub host_released_balls: BTreeSet<u8>,
    #[serde(default)]
    pub guest_released_balls: BTreeSet<u8>,
    #[serde(default)]
    pub host_released_team: Option<ReleasedTeam>,
    #[serde(default)]
    pub guest_released_team: Option<ReleasedTeam>,
    /// Liveness flag per participant, merged key by key.
    #[serde(default)]
    pub presence: BTreeMap<String, bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn default_max_players() -> u8 {
    MAX_PLAYERS
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl RoomDocument {
    /// Fresh room owned by `host`, waiting for a guest.
    pub fn new(room_id: impl Into<String>, host: &Identity, host_team: Option<Team>) -> Self {
        Self {
            room_id: room_id.into(),
            host_id: host.user_id.clone(),
            host_name: host.display_name.clone(),
            guest_id: None,
            guest_name: None,
            host_ready: false,
            guest_ready: false,
            host_team,
            guest_team: None,
            status: RoomStatus::Waiting,
            battle_id: None,
            current_players: 1,
            max_players: MAX_PLAYERS,
            host_animating_balls: BTreeSet::new(),
            guest_animating_balls: BTreeSet::new(),
            host_released_balls: BTreeSet::new(),
            guest_released_balls: BTreeSet::new(),
            host_released_team: None,
            guest_released_team: None,
            presence: BTreeMap::from([(host.user_id.clone(), true)]),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Guest identifier, treating an empty string as vacant.
    pub fn guest(&self) -> Option<&str> {
        non_empty(&self.guest_id)
    }

    /// Published battle identifier, treating an empty string as unassigned.
    pub fn battle(&self) -> Option<&str> {
        non_empty(&self.battle_id)
    }

    /// Identity occupying `seat`, if any.
    pub fn participant(&self, seat: Seat) -> Option<&str> {
        match seat {
            Seat::Host => Some(self.host_id.as_str()).filter(|id| !id.is_empty()),
            Seat::Guest => self.guest(),
        }
    }

    /// Display name of the participant in `seat`.
    pub fn participant_name(&self, seat: Seat) -> Option<&str> {
        match seat {
            Seat::Host => Some(self.host_name.as_str()),
            Seat::Guest => self.guest_name.as_deref(),
        }
    }

    /// Seat held by `user_id`.
    pub fn seat_of(&self, user_id: &str) -> Option<Seat> {
        if user_id.is_empty() {
            None
        } else if self.host_id == user_id {
            Some(Seat::Host)
        } else if self.guest() == Some(user_id) {
            Some(Seat::Guest)
        } else {
            None
        }
    }

    /// Role of `user_id` derived from this snapshot.
    pub fn role_of(&self, user_id: &str) -> Role {
        self.seat_of(user_id).map(Role::from).unwrap_or(Role::Observer)
    }

    /// Team selected for `seat`.
    pub fn team(&self, seat: Seat) -> Option<&Team> {
        match seat {
            Seat::Host => self.host_team.as_ref(),
            Seat::Guest => self.guest_team.as_ref(),
        }
    }

    /// Ready flag of `seat`.
    pub fn is_ready(&self, seat: Seat) -> bool {
        match seat {
            Seat::Host => self.host_ready,
            Seat::Guest => self.guest_ready,
        }
    }

    /// Slots of `seat` currently animating.
    pub fn animating_balls(&self, seat: Seat) -> &BTreeSet<u8> {
        match seat {
            Seat::Host => &self.host_animating_balls,
            Seat::Guest => &self.guest_animating_balls,
        }
    }

    /// Slots of `seat` already released.
    pub fn released_balls(&self, seat: Seat) -> &BTreeSet<u8> {
        match seat {
            Seat::Host => &self.host_released_balls,
            Seat::Guest => &self.guest_released_balls,
        }
    }

    /// Whether both seats are currently occupied.
    pub fn both_seats_filled(&self) -> bool {
        self.participant(Seat::Host).is_some() && self.guest().is_some()
    }

    /// Whether a new guest could take the seat right now.
    pub fn guest_seat_open(&self) -> bool {
        self.guest().is_none() && self.current_players < self.max_players
    }

    /// Whether the room should be offered to new joiners.
    pub fn is_joinable(&self) -> bool {
        self.status.is_open() && self.guest_seat_open()
    }
}

/// Conditions a store checks atomically with a write when it is able to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The guest seat is vacant (or already held by this user) and the room is open.
    GuestSeatOpen { user_id: String },
    /// No battle identifier has been published yet.
    BattleUnassigned,
}

impl Precondition {
    /// Evaluate the precondition against the current document.
    pub fn check(&self, doc: &RoomDocument) -> Result<(), &'static str> {
        match self {
            Precondition::GuestSeatOpen { user_id } => {
                if doc.host_id == *user_id {
                    return Err("host cannot take the guest seat");
                }
                if !doc.status.is_open() {
                    return Err("room is no longer open");
                }
                match doc.guest() {
                    Some(current) if current != user_id => Err("guest seat already taken"),
                    Some(_) => Ok(()),
                    None if doc.current_players >= doc.max_players => Err("room is full"),
                    None => Ok(()),
                }
            }
            Precondition::BattleUnassigned => {
                if doc.battle().is_some() {
                    Err("battle already assigned")
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Partial field merge applied atomically to a room document.
///
/// Nullable fields use a double option: `None` leaves the field untouched while
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub guest_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub guest_name: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ready: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub host_team: Option<Option<Team>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub guest_team: Option<Option<Team>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
    /// Set once; never cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_players: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_animating_balls: Option<BTreeSet<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_animating_balls: Option<BTreeSet<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_released_balls: Option<BTreeSet<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_released_balls: Option<BTreeSet<u8>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub host_released_team: Option<Option<ReleasedTeam>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub guest_released_team: Option<Option<ReleasedTeam>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub presence: BTreeMap<String, bool>,
    #[serde(skip)]
    pub precondition: Option<Precondition>,
}

impl RoomUpdate {
    /// Toggle the ready flag of `seat`.
    pub fn ready(seat: Seat, value: bool) -> Self {
        let mut update = Self::default();
        match seat {
            Seat::Host => update.host_ready = Some(value),
            Seat::Guest => update.guest_ready = Some(value),
        }
        update
    }

    /// Replace the team of `seat` and clear its ready flag in the same write.
    pub fn team_selected(seat: Seat, team: Team) -> Self {
        let mut update = Self::ready(seat, false);
        match seat {
            Seat::Host => update.host_team = Some(Some(team)),
            Seat::Guest => update.guest_team = Some(Some(team)),
        }
        update
    }

    /// Occupy the guest seat.
    pub fn guest_joined(guest: &Identity, team: Option<Team>) -> Self {
        Self {
            guest_id: Some(Some(guest.user_id.clone())),
            guest_name: Some(Some(guest.display_name.clone())),
            guest_ready: Some(false),
            guest_team: team.map(Some),
            current_players: Some(MAX_PLAYERS),
            guest_animating_balls: Some(BTreeSet::new()),
            guest_released_balls: Some(BTreeSet::new()),
            presence: BTreeMap::from([(guest.user_id.clone(), true)]),
            ..Self::default()
        }
    }

    /// Vacate the guest seat and reopen the room.
    pub fn guest_left(guest_id: &str) -> Self {
        Self {
            guest_id: Some(None),
            guest_name: Some(None),
            guest_team: Some(None),
            guest_ready: Some(false),
            guest_released_team: Some(None),
            current_players: Some(1),
            status: Some(RoomStatus::Waiting),
            presence: BTreeMap::from([(guest_id.to_string(), false)]),
            ..Self::default()
        }
    }

    /// Publish the battle identifier together with the battling status.
    pub fn battle_started(battle_id: impl Into<String>) -> Self {
        Self {
            status: Some(RoomStatus::Battling),
            battle_id: Some(battle_id.into()),
            precondition: Some(Precondition::BattleUnassigned),
            ..Self::default()
        }
    }

    /// Set the room status.
    pub fn status(status: RoomStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Liveness write for a single participant.
    pub fn presence(user_id: &str, present: bool) -> Self {
        Self {
            presence: BTreeMap::from([(user_id.to_string(), present)]),
            ..Self::default()
        }
    }

    /// Cosmetic release animation state for `seat`.
    pub fn release_animation(seat: Seat, animating: BTreeSet<u8>, released: BTreeSet<u8>) -> Self {
        let mut update = Self::default();
        match seat {
            Seat::Host => {
                update.host_animating_balls = Some(animating);
                update.host_released_balls = Some(released);
            }
            Seat::Guest => {
                update.guest_animating_balls = Some(animating);
                update.guest_released_balls = Some(released);
            }
        }
        update
    }

    /// Publish the released team of `seat`.
    pub fn released_team(seat: Seat, team: ReleasedTeam) -> Self {
        let mut update = Self::default();
        match seat {
            Seat::Host => update.host_released_team = Some(Some(team)),
            Seat::Guest => update.guest_released_team = Some(Some(team)),
        }
        update
    }

    /// Add a status change to the same write.
    pub fn with_status(mut self, status: RoomStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add a liveness flag to the same write.
    pub fn with_presence(mut self, user_id: &str, present: bool) -> Self {
        self.presence.insert(user_id.to_string(), present);
        self
    }

    /// Attach a precondition the store should enforce atomically.
    pub fn when(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Merge the named fields into `doc`.
    pub fn apply(&self, doc: &mut RoomDocument) {
        if let Some(value) = &self.guest_id {
            doc.guest_id = value.clone();
        }
        if let Some(value) = &self.guest_name {
            doc.guest_name = value.clone();
        }
        if let Some(value) = self.host_ready {
            doc.host_ready = value;
        }
        if let Some(value) = self.guest_ready {
            doc.guest_ready = value;
        }
        if let Some(value) = &self.host_team {
            doc.host_team = value.clone();
        }
        if let Some(value) = &self.guest_team {
            doc.guest_team = value.clone();
        }
        if let Some(value) = self.status {
            doc.status = value;
        }
        if let Some(value) = &self.battle_id {
            doc.battle_id = Some(value.clone());
        }
        if let Some(value) = self.current_players {
            doc.current_players = value;
        }
        if let Some(value) = &self.host_animating_balls {
            doc.host_animating_balls = value.clone();
        }
        if let Some(value) = &self.guest_animating_balls {
            doc.guest_animating_balls = value.clone();
        }
        if let Some(value) = &self.host_released_balls {
            doc.host_released_balls = value.clone();
        }
        if let Some(value) = &self.guest_released_balls {
            doc.guest_released_balls = value.clone();
        }
        if let Some(value) = &self.host_released_team {
            doc.host_released_team = value.clone();
        }
        if let Some(value) = &self.guest_released_team {
            doc.guest_released_team = value.clone();
        }
        for (user_id, present) in &self.presence {
            doc.presence.insert(user_id.clone(), *present);
        }
    }
}

/// One delivery on a room subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Latest full document.
    Snapshot(RoomDocument),
    /// The document no longer exists.
    Absent,
}
