use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    dao::{models::RoomUpdate, room_store::RoomStore, storage::StorageError},
    error::LobbyError,
    state::role::Role,
};

/// Debounced liveness writer for one `(room, user)` pair.
///
/// A trigger for a different value cancels the pending write and reschedules it, so rapid
/// mount/unmount sequences collapse into at most one write; a trigger for the value already
/// pending keeps that write. The value confirmed by the store is kept as a registration
/// marker; asking for it again is a no-op, and a failed write clears it so the next trigger
/// retries.
pub struct PresenceTracker {
    store: Arc<dyn RoomStore>,
    room_id: String,
    user_id: String,
    debounce: Duration,
    registered: Arc<Mutex<Option<bool>>>,
    pending: Option<(bool, JoinHandle<()>)>,
}

impl PresenceTracker {
    /// Tracker for `user_id` in `room_id`; nothing is written until the first trigger.
    pub fn new(
        store: Arc<dyn RoomStore>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            room_id: room_id.into(),
            user_id: user_id.into(),
            debounce,
            registered: Arc::new(Mutex::new(None)),
            pending: None,
        }
    }

    /// Debounced present write.
    pub fn mark_present(&mut self, role: Role) -> bool {
        self.mark(role, true)
    }

    /// Debounced absent write.
    pub fn mark_absent(&mut self, role: Role) -> bool {
        self.mark(role, false)
    }

    /// Schedule a presence write; returns whether a write is now pending.
    pub fn mark(&mut self, role: Role, present: bool) -> bool {
        if !role.is_participant() {
            debug!(room_id = %self.room_id, user_id = %self.user_id, "observer presence not written");
            return false;
        }

        if self.pending_value() == Some(present) {
            return true;
        }
        self.cancel();
        if self.registered() == Some(present) {
            debug!(
                room_id = %self.room_id,
                user_id = %self.user_id,
                present,
                "presence already registered"
            );
            return false;
        }

        let store = self.store.clone();
        let registered = self.registered.clone();
        let room_id = self.room_id.clone();
        let user_id = self.user_id.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let outcome = store
                .update_room(&room_id, RoomUpdate::presence(&user_id, present))
                .await;
            let mut marker = registered.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(_) => {
                    *marker = Some(present);
                    debug!(room_id = %room_id, user_id = %user_id, present, "presence written");
                }
                Err(err) => {
                    *marker = None;
                    let err = LobbyError::PresenceWriteFailed(err);
                    warn!(room_id = %room_id, user_id = %user_id, present, error = %err, "presence write failed; will retry on next trigger");
                }
            }
        });
        self.pending = Some((present, handle));
        true
    }

    /// Immediate, non-debounced absent write used on teardown. Best effort.
    pub async fn flush_absent(&mut self, role: Role) {
        self.cancel();
        if !role.is_participant() || self.registered() == Some(false) {
            return;
        }

        match self
            .store
            .update_room(&self.room_id, RoomUpdate::presence(&self.user_id, false))
            .await
        {
            Ok(_) => self.set_registered(Some(false)),
            Err(StorageError::NotFound { .. }) => {
                debug!(room_id = %self.room_id, "room gone before presence teardown");
            }
            Err(err) => {
                self.set_registered(None);
                warn!(room_id = %self.room_id, user_id = %self.user_id, error = %err, "presence teardown write failed");
            }
        }
    }

    /// Drop any pending write without touching the registration marker.
    pub fn cancel(&mut self) {
        if let Some((_, handle)) = self.pending.take() {
            handle.abort();
        }
    }

    /// Whether a scheduled write has not completed yet.
    pub fn is_pending(&self) -> bool {
        self.pending_value().is_some()
    }

    fn pending_value(&self) -> Option<bool> {
        self.pending
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(present, _)| *present)
    }

    /// Value last confirmed by the store.
    pub fn registered(&self) -> Option<bool> {
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_registered(&self, value: Option<bool>) {
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}
