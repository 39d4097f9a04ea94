use crate::{now_ms, CoreError};
use async_trait::async_trait;
use relaybridge_db::{disappearing, DbPool};
use relaybridge_models::disappearing::DisappearingMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Local room-deletion client. Must tolerate being asked to redact an event
/// that is already gone.
#[async_trait]
pub trait RoomRedactor: Send + Sync {
    async fn redact(&self, room_id: &str, event_id: &str) -> Result<(), CoreError>;
}

/// Schedule deletion of `event_id` `seconds` from `now_ms`.
pub async fn schedule_for(
    pool: &DbPool,
    room_id: &str,
    event_id: &str,
    seconds: i64,
    now_ms: i64,
) -> Result<DisappearingMessage, CoreError> {
    let entry = DisappearingMessage::new(room_id, event_id, seconds, now_ms);
    disappearing::schedule(pool, &entry).await?;
    Ok(entry)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPass {
    pub redacted: usize,
    pub failed: usize,
}

pub struct ExpiryTicker {
    pool: DbPool,
    redactor: Arc<dyn RoomRedactor>,
    interval: Duration,
}

impl ExpiryTicker {
    pub fn new(pool: DbPool, redactor: Arc<dyn RoomRedactor>, interval: Duration) -> Self {
        Self {
            pool,
            redactor,
            interval,
        }
    }

    /// One poll: redact everything due and drop the entries that were
    /// redacted. Failed entries stay scheduled and come back in a later epoch.
    pub async fn process(
        &self,
        poll_interval_seconds: Option<u64>,
        now_ms: i64,
    ) -> Result<ExpiryPass, CoreError> {
        let due = disappearing::poll_due(&self.pool, now_ms, poll_interval_seconds).await?;
        let mut pass = ExpiryPass::default();
        for entry in due {
            match self.redactor.redact(&entry.room_id, &entry.event_id).await {
                Ok(()) => {
                    disappearing::cancel(&self.pool, &entry.room_id, &entry.event_id).await?;
                    pass.redacted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        room_id = %entry.room_id,
                        event_id = %entry.event_id,
                        "expiry: redaction failed: {}",
                        e
                    );
                    pass.failed += 1;
                }
            }
        }
        if pass.redacted > 0 || pass.failed > 0 {
            tracing::info!(redacted = pass.redacted, failed = pass.failed, "expiry: pass complete");
        }
        Ok(pass)
    }

    /// Startup sweep of every overdue entry, then a steady-state poll per tick
    /// until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.process(None, now_ms()).await {
                tracing::warn!("expiry: startup sweep failed: {}", e);
            }

            let interval_secs = self.interval.as_secs().max(1);
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // the startup sweep covered the immediate tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.process(Some(interval_secs), now_ms()).await {
                            tracing::warn!("expiry: poll failed: {}", e);
                        }
                    }
                }
            }
            tracing::info!("expiry: ticker stopped");
        })
    }
}
