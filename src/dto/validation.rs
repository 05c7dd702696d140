//! Validation helpers for team payloads.

use validator::ValidationError;

/// Upper bound on the number of slots in a team.
pub const MAX_TEAM_SLOTS: usize = 6;

/// Validates the number of slots of a team.
///
/// # Examples
///
/// ```ignore
/// validate_slot_count(6) // Ok
/// validate_slot_count(0) // Err - empty team
/// validate_slot_count(7) // Err - too many slots
/// ```
pub fn validate_slot_count(count: usize) -> Result<(), ValidationError> {
    if count == 0 || count > MAX_TEAM_SLOTS {
        let mut err = ValidationError::new("team_size");
        err.message = Some(
            format!("A team must hold between 1 and {MAX_TEAM_SLOTS} slots (got {count})").into(),
        );
        return Err(err);
    }

    Ok(())
}

/// Validates that every move of a slot carries a non-blank name.
pub fn validate_move_names(moves: &[String]) -> Result<(), ValidationError> {
    if moves.iter().any(|name| name.trim().is_empty()) {
        let mut err = ValidationError::new("move_name_blank");
        err.message = Some("Move names must not be blank".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_slot_count_bounds() {
        assert!(validate_slot_count(1).is_ok());
        assert!(validate_slot_count(6).is_ok());
        assert!(validate_slot_count(0).is_err());
        assert!(validate_slot_count(7).is_err());
    }

    #[test]
    fn test_validate_move_names() {
        assert!(validate_move_names(&["tackle".into(), "growl".into()]).is_ok());
        assert!(validate_move_names(&["tackle".into(), "  ".into()]).is_err());
        assert!(validate_move_names(&["".into()]).is_err());
    }
}
