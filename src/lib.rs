//! Lobby-to-battle handoff coordinator.
//!
//! Two clients share a replicated room document. Each client runs a [`services::session`]
//! that negotiates seats, teams and readiness, then hands control to the battle runtime
//! exactly once per room, with both sides landing on the same battle id.

/// JSON configuration with defaults.
pub mod config;
/// Room storage, battle collaborators and wire models.
pub mod dao;
/// Payloads exchanged with callers.
pub mod dto;
/// Coordinator error taxonomy.
pub mod error;
/// Lobby operations and the per-client session.
pub mod services;
/// Shared context, roles, room views and the hand-off guard.
pub mod state;
