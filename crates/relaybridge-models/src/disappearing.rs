use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisappearingMessage {
    pub room_id: String,
    pub event_id: String,
    pub expiration_seconds: i64,
    /// Absolute deadline in epoch milliseconds.
    pub expiration_ts: i64,
    /// Last time this entry was handed to a consumer, epoch milliseconds.
    pub unqueued_ts: Option<i64>,
}

impl DisappearingMessage {
    pub fn new(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        expiration_seconds: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            event_id: event_id.into(),
            expiration_seconds,
            expiration_ts: now_ms.saturating_add(expiration_seconds.saturating_mul(1000)),
            unqueued_ts: None,
        }
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.expiration_ts <= now_ms
    }
}
