use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dao::models::RoomDocument;

/// Document id prefix for rooms.
pub const ROOM_PREFIX: &str = "room::";
/// High sentinel closing an `_all_docs` key range.
pub const END_SUFFIX: &str = "\u{ffff}";

/// CouchDB document id of a room.
pub fn room_doc_id(room_id: &str) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PutResponse {
    pub rev: String,
}

/// One page of the `_changes` feed.
#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Sequence tokens are strings on CouchDB 2+ and integers on 1.x.
pub fn seq_token(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Room document as persisted, wrapped with CouchDB's bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchRoomDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub room: RoomDocument,
}

impl CouchRoomDocument {
    /// Wrap a room with an optional revision.
    pub fn new(room: RoomDocument, rev: Option<String>) -> Self {
        Self {
            id: room_doc_id(&room.room_id),
            rev,
            room,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::role::Identity;

    #[test]
    fn document_flattens_room_fields_next_to_bookkeeping() {
        let room = RoomDocument::new("r1", &Identity::new("h", "Host"), None);
        let doc = CouchRoomDocument::new(room, Some("1-abc".into()));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["_id"], "room::r1");
        assert_eq!(json["_rev"], "1-abc");
        assert_eq!(json["roomId"], "r1");

        let back: CouchRoomDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back.room.host_id, "h");
    }

    #[test]
    fn sequence_tokens_accept_both_formats() {
        assert_eq!(seq_token(&serde_json::json!("12-g1AAAA")), "12-g1AAAA");
        assert_eq!(seq_token(&serde_json::json!(42)), "42");
    }
}
