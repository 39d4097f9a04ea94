//! Collaborators the engine needs from the two networks.
//!
//! The remote network client and the local room API are attached by the
//! embedding bridge. Until one is attached the binary runs with these:
//! history fetches fail transiently (jobs stay queued), and expired messages
//! are flagged redacted in the message store.

use async_trait::async_trait;
use relaybridge_core::backfill::{HistoryBatch, HistoryClient, HistoryError};
use relaybridge_core::expiry::RoomRedactor;
use relaybridge_core::CoreError;
use relaybridge_db::{messages, DbPool};
use relaybridge_models::backfill::BackfillJob;

pub struct DetachedHistory;

#[async_trait]
impl HistoryClient for DetachedHistory {
    async fn fetch_batch(
        &self,
        job: &BackfillJob,
        _anchor: Option<i64>,
        _limit: usize,
    ) -> Result<HistoryBatch, HistoryError> {
        Err(HistoryError::Transient(format!(
            "no remote client attached for {}",
            job.owner_user
        )))
    }
}

pub struct StoreRedactor {
    pool: DbPool,
}

impl StoreRedactor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRedactor for StoreRedactor {
    async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), CoreError> {
        let touched = messages::mark_redacted(&self.pool, event_id, room_id).await?;
        tracing::debug!(room_id, event_id, touched, "expiry: mapping flagged redacted");
        Ok(())
    }
}
