use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::dto::validation::{validate_move_names, validate_slot_count};

/// Team payload stored in the room document for each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    /// Ordered roster slots.
    pub slots: Vec<TeamSlot>,
}

/// A single roster entry of a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TeamSlot {
    /// Species identifier from the catalog.
    #[serde(rename = "id")]
    #[validate(range(min = 1, message = "species id must be positive"))]
    pub species_id: u32,
    #[validate(range(min = 1, max = 100, message = "level must be between 1 and 100"))]
    pub level: u8,
    #[validate(length(min = 1, max = 4, message = "a slot needs between 1 and 4 moves"))]
    pub moves: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nature: Option<String>,
}

impl TeamSlot {
    /// Convenience constructor used by callers that assemble teams programmatically.
    pub fn new(species_id: u32, level: u8, moves: &[&str]) -> Self {
        Self {
            species_id,
            level,
            moves: moves.iter().map(|name| (*name).to_string()).collect(),
            nature: None,
        }
    }

    fn canonical_entry(&self) -> String {
        let mut moves = self
            .moves
            .iter()
            .map(|name| name.trim().to_lowercase())
            .collect::<Vec<_>>();
        moves.sort();
        format!("{}@{}:{}", self.species_id, self.level, moves.join(","))
    }
}

impl Team {
    /// Order-independent encoding of the lineup (species, level and sorted moves).
    ///
    /// Slot order, move order and natures do not contribute, so two teams sharing a signature
    /// field the same battle.
    pub fn canonical_signature(&self) -> String {
        let mut entries = self
            .slots
            .iter()
            .map(TeamSlot::canonical_entry)
            .collect::<Vec<_>>();
        entries.sort();
        entries.join("|")
    }

    /// Whether both teams encode the same lineup.
    pub fn is_same_lineup(&self, other: &Team) -> bool {
        self.canonical_signature() == other.canonical_signature()
    }
}

impl Validate for Team {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.name.trim().is_empty() {
            let mut err = ValidationError::new("team_name_empty");
            err.message = Some("Team name must not be empty".into());
            errors.add("name", err);
        }

        if let Err(e) = validate_slot_count(self.slots.len()) {
            errors.add("slots", e);
        }

        for slot in &self.slots {
            if let Err(slot_errors) = slot.validate() {
                errors.merge_self("slots", Err(slot_errors));
            }
            if let Err(e) = validate_move_names(&slot.moves) {
                errors.add("moves", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Display snapshot of the last released team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedTeam {
    pub name: String,
    pub sprites: Vec<String>,
}
