/// Start preconditions and battle publication.
pub mod battle_coordinator;
/// Opponent-forfeit detection.
pub mod forfeit;
/// Debounced presence writes.
pub mod presence;
/// Ready toggles and the implicit join.
pub mod ready;
/// Cosmetic ball-release synchronization.
pub mod release;
/// Room lifecycle operations (create, join, leave, list).
pub mod room_service;
/// Per-client session controller.
pub mod session;
