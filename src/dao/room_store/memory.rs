use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use futures::{future::BoxFuture, stream::BoxStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::dao::{
    models::{RoomDocument, RoomEvent, RoomUpdate},
    storage::{StorageError, StorageResult},
};

use super::RoomStore;

const CHANNEL_CAPACITY: usize = 64;

struct RoomSlot {
    doc: Option<RoomDocument>,
    revision: u64,
    tx: broadcast::Sender<RoomEvent>,
}

impl RoomSlot {
    fn vacant() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            doc: None,
            revision: 0,
            tx,
        }
    }

    fn current(&self) -> RoomEvent {
        self.doc
            .clone()
            .map(RoomEvent::Snapshot)
            .unwrap_or(RoomEvent::Absent)
    }

    fn publish(&mut self) {
        self.revision += 1;
        // No receivers is fine: nobody is watching this room yet.
        let _ = self.tx.send(self.current());
    }
}

#[derive(Default)]
struct Inner {
    rooms: DashMap<String, RoomSlot>,
    failing_writes: AtomicUsize,
    writes: AtomicU64,
}

/// Process-local room store with the same ordering guarantees as the replicated one.
///
/// Every mutation is applied and broadcast while holding the room's map entry, so all
/// subscribers see the same sequence of versions.
#[derive(Clone, Default)]
pub struct InMemoryRoomStore {
    inner: Arc<Inner>,
}

impl InMemoryRoomStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server revision of a room; bumps on every accepted write.
    pub fn revision(&self, room_id: &str) -> u64 {
        self.inner
            .rooms
            .get(room_id)
            .map(|slot| slot.revision)
            .unwrap_or(0)
    }

    /// Number of live subscriptions on a room.
    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.inner
            .rooms
            .get(room_id)
            .map(|slot| slot.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Accepted writes across all rooms (creates, updates and deletes).
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` writes fail as if the backend were unreachable.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self, room_id: &str) -> StorageResult<()> {
        let injected = self
            .inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StorageError::unavailable(
                format!("write to room `{room_id}` dropped"),
                io::Error::new(io::ErrorKind::ConnectionReset, "injected failure"),
            ))
        } else {
            Ok(())
        }
    }

    fn create_sync(&self, room: RoomDocument) -> StorageResult<()> {
        self.take_injected_failure(&room.room_id)?;
        let mut slot = self
            .inner
            .rooms
            .entry(room.room_id.clone())
            .or_insert_with(RoomSlot::vacant);
        slot.doc = Some(room);
        slot.publish();
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_sync(&self, room_id: &str, update: RoomUpdate) -> StorageResult<RoomDocument> {
        self.take_injected_failure(room_id)?;
        let mut slot = self
            .inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StorageError::NotFound {
                room_id: room_id.to_string(),
            })?;
        let doc = slot.doc.as_mut().ok_or_else(|| StorageError::NotFound {
            room_id: room_id.to_string(),
        })?;

        if let Some(precondition) = &update.precondition {
            precondition
                .check(doc)
                .map_err(|reason| StorageError::PreconditionFailed {
                    room_id: room_id.to_string(),
                    reason,
                })?;
        }

        update.apply(doc);
        let updated = doc.clone();
        slot.publish();
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    fn delete_sync(&self, room_id: &str) -> StorageResult<()> {
        self.take_injected_failure(room_id)?;
        if let Some(mut slot) = self.inner.rooms.get_mut(room_id)
            && slot.doc.take().is_some()
        {
            // The slot stays as a tombstone so open subscriptions keep their channel.
            slot.publish();
            self.inner.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn snapshot(&self, room_id: &str) -> RoomEvent {
        self.inner
            .rooms
            .get(room_id)
            .map(|slot| slot.current())
            .unwrap_or(RoomEvent::Absent)
    }
}

impl RoomStore for InMemoryRoomStore {
    fn create_room(&self, room: RoomDocument) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.create_sync(room);
        Box::pin(async move { result })
    }

    fn get_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<Option<RoomDocument>>> {
        let doc = self
            .inner
            .rooms
            .get(room_id)
            .and_then(|slot| slot.doc.clone());
        Box::pin(async move { Ok(doc) })
    }

    fn update_room(
        &self,
        room_id: &str,
        update: RoomUpdate,
    ) -> BoxFuture<'static, StorageResult<RoomDocument>> {
        let result = self.update_sync(room_id, update);
        Box::pin(async move { result })
    }

    fn delete_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.delete_sync(room_id);
        Box::pin(async move { result })
    }

    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<RoomDocument>>> {
        let rooms = self
            .inner
            .rooms
            .iter()
            .filter_map(|slot| slot.doc.clone())
            .collect::<Vec<_>>();
        Box::pin(async move { Ok(rooms) })
    }

    fn subscribe(&self, room_id: &str) -> BoxStream<'static, StorageResult<RoomEvent>> {
        let (initial, mut rx) = {
            let slot = self
                .inner
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(RoomSlot::vacant);
            (slot.current(), slot.tx.subscribe())
        };
        let store = self.clone();
        let room_id = room_id.to_string();

        Box::pin(async_stream::stream! {
            yield Ok(initial);
            loop {
                match rx.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(room_id = %room_id, skipped, "room subscription lagged; resyncing");
                        yield Ok(store.snapshot(&room_id));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
