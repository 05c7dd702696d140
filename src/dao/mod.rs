/// Battle engine and mirror collaborators.
pub mod battle;
/// Room document model and field updates.
pub mod models;
/// Replicated room document stores.
pub mod room_store;
/// Storage abstraction layer shared by every backend.
pub mod storage;
