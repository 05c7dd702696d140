#[cfg(feature = "couch-store")]
pub mod couchdb;
/// Process-local store.
pub mod memory;

use futures::{future::BoxFuture, stream::BoxStream};

use crate::dao::{
    models::{RoomDocument, RoomEvent, RoomUpdate},
    storage::StorageResult,
};

pub use memory::InMemoryRoomStore;

/// Replicated room document store shared by every client of a room.
///
/// Each subscriber observes versions of a document in one consistent order; nothing is
/// promised across subscribers.
pub trait RoomStore: Send + Sync {
    /// Create the document, replacing nothing if it already exists.
    fn create_room(&self, room: RoomDocument) -> BoxFuture<'static, StorageResult<()>>;
    /// Point read of the latest document.
    fn get_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<Option<RoomDocument>>>;
    /// Merge the named fields atomically and return the resulting document.
    fn update_room(
        &self,
        room_id: &str,
        update: RoomUpdate,
    ) -> BoxFuture<'static, StorageResult<RoomDocument>>;
    /// Remove the document. Deleting a missing room succeeds.
    fn delete_room(&self, room_id: &str) -> BoxFuture<'static, StorageResult<()>>;
    /// Every room currently stored.
    fn list_rooms(&self) -> BoxFuture<'static, StorageResult<Vec<RoomDocument>>>;
    /// Push stream starting with the current value, then one item per change.
    fn subscribe(&self, room_id: &str) -> BoxStream<'static, StorageResult<RoomEvent>>;
}
