use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    /// Local event carrying the reaction itself.
    pub local_event_id: String,
    pub local_room_id: String,
    /// Local event the reaction points at.
    pub target_local_event_id: String,
    pub remote_sender_id: i64,
    pub reaction: String,
}
