/// Events emitted by a running session.
pub mod events;
/// Parameter bundle passed to the battle runtime.
pub mod handoff;
/// Team payloads and lineup comparison.
pub mod team;
/// Shared validation helpers.
pub mod validation;
