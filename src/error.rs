use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::{battle::BattleServiceError, storage::StorageError},
    state::state_machine::InvalidTransition,
};

/// Errors surfaced by lobby operations.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// Another guest holds the seat or the room stopped accepting joins.
    #[error("room is no longer joinable")]
    JoinConflict,
    #[error("team invalid: {0}")]
    TeamInvalid(String),
    /// Both sides picked structurally identical teams.
    #[error("both players picked the same team")]
    IdenticalTeams,
    /// A start precondition does not hold.
    #[error("cannot start battle: {0}")]
    StartBlocked(String),
    #[error("battle creation failed: {0}")]
    BattleCreationFailed(String),
    /// The secondary mirror could not be seeded. Never fatal.
    #[error("battle mirror hydration failed")]
    MirrorHydrationFailed(#[source] StorageError),
    #[error("presence write failed")]
    PresenceWriteFailed(#[source] StorageError),
    /// The battle id is not visible yet; try again shortly.
    #[error("battle is not ready yet")]
    NotReadyYet,
    #[error("user does not occupy a seat in this room")]
    NotParticipant,
    #[error("only the host may do this")]
    NotHost,
    /// A hand-off is in flight; the request would race it.
    #[error("battle hand-off in progress")]
    HandoffInProgress,
    #[error("room `{0}` does not exist")]
    RoomMissing(String),
    #[error("storage failure")]
    Store(#[from] StorageError),
    /// The session task is gone.
    #[error("session closed")]
    SessionClosed,
}

impl LobbyError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LobbyError::NotReadyYet
                | LobbyError::PresenceWriteFailed(_)
                | LobbyError::Store(StorageError::Unavailable { .. })
        )
    }

    /// Whether the error should be shown to the player rather than only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            LobbyError::TeamInvalid(_)
                | LobbyError::IdenticalTeams
                | LobbyError::BattleCreationFailed(_)
                | LobbyError::StartBlocked(_)
        )
    }
}

impl From<ValidationErrors> for LobbyError {
    fn from(err: ValidationErrors) -> Self {
        LobbyError::TeamInvalid(format!("validation failed: {}", err))
    }
}

impl From<InvalidTransition> for LobbyError {
    fn from(_: InvalidTransition) -> Self {
        LobbyError::HandoffInProgress
    }
}

impl From<BattleServiceError> for LobbyError {
    fn from(err: BattleServiceError) -> Self {
        LobbyError::BattleCreationFailed(err.to_string())
    }
}
