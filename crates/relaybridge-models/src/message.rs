use serde::{Deserialize, Serialize};

/// One bridged revision of a remote message.
///
/// Primary identity is `(remote_msg_id, space, edit_index)`. The local side is
/// addressed by `(local_event_id, local_room_id, space)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub remote_msg_id: i64,
    /// Remote update stream the id was allocated in. Remote message ids are
    /// only unique within one space.
    pub space: i64,
    /// 0 for the original message, incremented once per edit.
    pub edit_index: i64,
    pub local_event_id: String,
    pub local_room_id: String,
    pub redacted: bool,
    pub content_hash: Option<Vec<u8>>,
    pub sender_local_id: Option<String>,
    pub sender_remote_id: Option<i64>,
}

impl MessageRecord {
    pub fn new(
        remote_msg_id: i64,
        space: i64,
        local_event_id: impl Into<String>,
        local_room_id: impl Into<String>,
    ) -> Self {
        Self {
            remote_msg_id,
            space,
            edit_index: 0,
            local_event_id: local_event_id.into(),
            local_room_id: local_room_id.into(),
            redacted: false,
            content_hash: None,
            sender_local_id: None,
            sender_remote_id: None,
        }
    }

    pub fn with_edit_index(mut self, edit_index: i64) -> Self {
        self.edit_index = edit_index;
        self
    }

    pub fn with_sender(mut self, local: Option<String>, remote: Option<i64>) -> Self {
        self.sender_local_id = local;
        self.sender_remote_id = remote;
        self
    }

    pub fn with_content_hash(mut self, hash: Vec<u8>) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn is_edit(&self) -> bool {
        self.edit_index > 0
    }
}
