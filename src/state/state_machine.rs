use thiserror::Error;
use tokio::time::Instant;

/// Phases of the navigation guard protecting a room while a battle is being set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffPhase {
    /// Nothing in flight; cleanup effects run normally.
    Idle,
    /// The host is creating the battle.
    Starting {
        /// End of the suppression window opened when the start began.
        grace_until: Instant,
    },
    /// The battle id is published and the hand-off is imminent.
    Grace {
        /// Published battle.
        battle_id: String,
        /// End of the suppression window.
        grace_until: Instant,
        /// Moment the host is forced into hand-off if the echo never arrives.
        fallback_at: Instant,
    },
    /// Control has passed to the battle runtime. Terminal.
    HandedOff {
        /// Battle the session entered.
        battle_id: String,
    },
}

impl HandoffPhase {
    /// Short name used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            HandoffPhase::Idle => "idle",
            HandoffPhase::Starting { .. } => "starting",
            HandoffPhase::Grace { .. } => "grace",
            HandoffPhase::HandedOff { .. } => "handed_off",
        }
    }
}

/// Events that can be applied to the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffEvent {
    /// The host begins battle creation.
    BeginStart {
        /// End of the suppression window.
        grace_until: Instant,
    },
    /// The battle id was written to the room.
    CreationPublished {
        /// Published battle.
        battle_id: String,
        /// Forced host hand-off time.
        fallback_at: Instant,
    },
    /// Creation or publication failed before the id became visible.
    CreationFailed,
    /// The session handed off to the battle runtime.
    HandOff {
        /// Battle being entered.
        battle_id: String,
    },
    /// The grace window elapsed without a hand-off, whether or not the id was published.
    GraceExpired,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {}", .from.label())]
pub struct InvalidTransition {
    /// The phase the guard was in when the event was received.
    pub from: HandoffPhase,
    /// The event that cannot be applied from this phase.
    pub event: HandoffEvent,
}

/// Snapshot of the guard broadcast to session listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Phase at the time of the snapshot.
    pub phase: HandoffPhase,
    /// Increments on each applied transition.
    pub version: usize,
}

/// Typed replacement for the ad-hoc navigation flags of a lobby client.
#[derive(Debug, Clone)]
pub struct HandoffStateMachine {
    phase: HandoffPhase,
    version: usize,
}

impl Default for HandoffStateMachine {
    fn default() -> Self {
        Self {
            phase: HandoffPhase::Idle,
            version: 0,
        }
    }
}

impl HandoffStateMachine {
    /// Guard in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> &HandoffPhase {
        &self.phase
    }

    /// Number of applied transitions.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Phase and version for listeners.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase.clone(),
            version: self.version,
        }
    }

    /// Nothing in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, HandoffPhase::Idle)
    }

    /// Terminal phase reached.
    pub fn is_handed_off(&self) -> bool {
        matches!(self.phase, HandoffPhase::HandedOff { .. })
    }

    /// Whether room-finish, presence-absent, missing-room redirect and forfeit detection
    /// must be held back.
    pub fn suppresses_cleanup(&self) -> bool {
        matches!(
            self.phase,
            HandoffPhase::Starting { .. } | HandoffPhase::Grace { .. }
        )
    }

    /// Published battle id, once known.
    pub fn battle_id(&self) -> Option<&str> {
        match &self.phase {
            HandoffPhase::Grace { battle_id, .. } | HandoffPhase::HandedOff { battle_id } => {
                Some(battle_id)
            }
            _ => None,
        }
    }

    /// Earliest timer the owning session has to wake up for.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            HandoffPhase::Grace {
                grace_until,
                fallback_at,
                ..
            } => Some((*grace_until).min(*fallback_at)),
            HandoffPhase::Starting { grace_until } => Some(*grace_until),
            _ => None,
        }
    }

    /// Validate and apply `event`, returning the new phase.
    pub fn apply(&mut self, event: HandoffEvent) -> Result<HandoffPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        self.phase = next;
        self.version += 1;
        Ok(self.phase.clone())
    }

    fn compute_transition(&self, event: HandoffEvent) -> Result<HandoffPhase, InvalidTransition> {
        let next = match (&self.phase, event) {
            (HandoffPhase::Idle, HandoffEvent::BeginStart { grace_until }) => {
                HandoffPhase::Starting { grace_until }
            }
            (
                HandoffPhase::Starting { grace_until },
                HandoffEvent::CreationPublished {
                    battle_id,
                    fallback_at,
                },
            ) => HandoffPhase::Grace {
                battle_id,
                grace_until: *grace_until,
                fallback_at,
            },
            (HandoffPhase::Starting { .. }, HandoffEvent::CreationFailed) => HandoffPhase::Idle,
            (
                HandoffPhase::Idle | HandoffPhase::Starting { .. } | HandoffPhase::Grace { .. },
                HandoffEvent::HandOff { battle_id },
            ) => HandoffPhase::HandedOff { battle_id },
            (
                HandoffPhase::Starting { .. } | HandoffPhase::Grace { .. },
                HandoffEvent::GraceExpired,
            ) => HandoffPhase::Idle,
            (from, event) => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event,
                });
            }
        };

        Ok(next)
    }
}
