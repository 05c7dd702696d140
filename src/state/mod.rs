mod events;
/// Seats, roles and identities.
pub mod role;
/// Hand-off guard phases and transitions.
pub mod state_machine;
/// Guard transitions with logging and broadcast.
pub mod transitions;
/// Deduplicated room snapshots.
pub mod view;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    dao::{
        battle::{BattleMirror, BattleService},
        room_store::RoomStore,
    },
};

pub use self::events::EventHub;
pub use self::state_machine::{HandoffEvent, HandoffPhase, HandoffStateMachine, Snapshot};
pub use self::view::RoomView;

/// Context shared by every session.
pub type SharedContext = Arc<LobbyContext>;

/// Collaborators shared by every session of a client process.
pub struct LobbyContext {
    store: Arc<dyn RoomStore>,
    battles: Arc<dyn BattleService>,
    mirror: Arc<dyn BattleMirror>,
    config: AppConfig,
}

impl LobbyContext {
    /// Construct the context wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        store: Arc<dyn RoomStore>,
        battles: Arc<dyn BattleService>,
        mirror: Arc<dyn BattleMirror>,
        config: AppConfig,
    ) -> SharedContext {
        Arc::new(Self {
            store,
            battles,
            mirror,
            config,
        })
    }

    /// Room store handle.
    pub fn store(&self) -> Arc<dyn RoomStore> {
        self.store.clone()
    }

    /// Battle service handle.
    pub fn battles(&self) -> Arc<dyn BattleService> {
        self.battles.clone()
    }

    /// Battle mirror handle.
    pub fn mirror(&self) -> Arc<dyn BattleMirror> {
        self.mirror.clone()
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
