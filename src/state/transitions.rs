use tracing::info;

use crate::{
    dto::events::SessionEvent,
    error::LobbyError,
    state::{EventHub, HandoffEvent, HandoffPhase, HandoffStateMachine},
};

/// Apply a guard transition, then broadcast the resulting phase to session listeners.
pub fn apply_with_broadcast(
    machine: &mut HandoffStateMachine,
    hub: &EventHub,
    room_id: &str,
    event: HandoffEvent,
) -> Result<HandoffPhase, LobbyError> {
    let from = machine.phase().label();
    let next = machine.apply(event)?;
    info!(
        room_id,
        from,
        to = next.label(),
        version = machine.version(),
        "handoff guard transition"
    );
    hub.broadcast(SessionEvent::HandoffPhaseChanged {
        phase: next.label().to_string(),
        version: machine.version(),
    });
    Ok(next)
}
