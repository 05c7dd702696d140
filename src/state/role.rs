use serde::{Deserialize, Serialize};

/// One of the two seats of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seat {
    Host,
    Guest,
}

impl Seat {
    /// The seat across the table.
    pub fn opponent(self) -> Seat {
        match self {
            Seat::Host => Seat::Guest,
            Seat::Guest => Seat::Host,
        }
    }
}

/// Role of the local user relative to the latest room snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
    /// Not (yet) occupying either seat.
    Observer,
}

impl Role {
    /// Seat occupied by this role, if any.
    pub fn seat(self) -> Option<Seat> {
        match self {
            Role::Host => Some(Seat::Host),
            Role::Guest => Some(Seat::Guest),
            Role::Observer => None,
        }
    }

    /// Whether the role owns a seat in the room.
    pub fn is_participant(self) -> bool {
        self.seat().is_some()
    }
}

impl From<Seat> for Role {
    fn from(value: Seat) -> Self {
        match value {
            Seat::Host => Role::Host,
            Seat::Guest => Role::Guest,
        }
    }
}

/// Authenticated user as handed to us by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Opaque stable user identifier.
    pub user_id: String,
    /// Display name shown to the opponent.
    pub display_name: String,
}

impl Identity {
    /// Build an identity from its two parts.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}
