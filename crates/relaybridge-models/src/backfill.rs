use serde::{Deserialize, Serialize};

/// A job still sitting in the queue. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: i64,
    pub owner_user: String,
    /// Lower is more urgent.
    pub priority: i32,
    pub chat_id: i64,
    pub chat_space_id: i64,
    pub anchor_message_id: Option<i64>,
    pub batch_size: i32,
    /// Seconds to sleep between two batches.
    pub inter_batch_delay: i32,
    /// -1 means no limit.
    pub max_batches: i32,
    pub dispatched_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cooldown_until: Option<i64>,
}

/// Insert form of [`BackfillJob`]; the queue assigns `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBackfillJob {
    pub owner_user: String,
    pub priority: i32,
    pub chat_id: i64,
    pub chat_space_id: i64,
    pub anchor_message_id: Option<i64>,
    pub batch_size: i32,
    pub inter_batch_delay: i32,
    pub max_batches: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    Pending,
    Cooldown,
    Dispatched,
    Done,
}

impl BackfillJob {
    /// Where the job sits in its lifecycle at `now_ms`. A dispatch older than
    /// `stale_after_ms` counts as abandoned and the job is pending again.
    pub fn state(&self, now_ms: i64, stale_after_ms: i64) -> BackfillState {
        if self.completed_at.is_some() {
            return BackfillState::Done;
        }
        if self.cooldown_until.is_some_and(|until| until > now_ms) {
            return BackfillState::Cooldown;
        }
        match self.dispatched_at {
            Some(at) if at > now_ms - stale_after_ms => BackfillState::Dispatched,
            _ => BackfillState::Pending,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_batches < 0
    }
}
