//! Backfill worker: claims queued history-import jobs and pages remote
//! history into the message store, one job per owner at a time.

use crate::{now_ms, CoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use relaybridge_db::{backfill, messages, DbError, DbPool};
use relaybridge_models::backfill::{BackfillJob, NewBackfillJob};
use relaybridge_models::message::MessageRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One page of already-translated history, newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryBatch {
    pub messages: Vec<MessageRecord>,
    /// Anchor for the next (older) page; `None` once history is exhausted.
    pub next_anchor: Option<i64>,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("transient history error: {0}")]
    Transient(String),
}

/// Remote chat-history pagination client.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    /// Fetch up to `limit` messages older than `anchor` (from the newest
    /// message when `anchor` is `None`).
    async fn fetch_batch(
        &self,
        job: &BackfillJob,
        anchor: Option<i64>,
        limit: usize,
    ) -> Result<HistoryBatch, HistoryError>;
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    /// Cooldown applied when a rate-limit signal carries no retry hint.
    pub rate_limit_cooldown_secs: u64,
    pub default_batch_size: i32,
    pub default_inter_batch_delay_secs: i32,
    pub default_max_batches: i32,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(15 * 60),
            rate_limit_cooldown_secs: 60,
            default_batch_size: 100,
            default_inter_batch_delay_secs: 1,
            default_max_batches: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// `mark_done` was called: history exhausted or `max_batches` reached.
    Completed { batches: i32, imported: u64 },
    /// Stopped between batches by an external signal; the job is pending.
    Cancelled { batches: i32 },
    /// The remote asked us to back off.
    CoolingDown { seconds: u64 },
    /// Transient failure; the job is pending again.
    Released { reason: String },
    /// The job row was deleted while running, e.g. by a chat teardown.
    Removed,
}

struct RunningJob {
    owner_user: String,
    chat_id: i64,
    chat_space_id: i64,
    cancel: CancellationToken,
}

pub struct BackfillWorker {
    pool: DbPool,
    client: Arc<dyn HistoryClient>,
    settings: BackfillSettings,
    running: DashMap<i64, RunningJob>,
}

impl BackfillWorker {
    pub fn new(pool: DbPool, client: Arc<dyn HistoryClient>, settings: BackfillSettings) -> Self {
        Self {
            pool,
            client,
            settings,
            running: DashMap::new(),
        }
    }

    fn stale_after_ms(&self) -> i64 {
        i64::try_from(self.settings.stale_after.as_millis()).unwrap_or(i64::MAX)
    }

    /// Queue history import for a chat unless an unfinished job for it
    /// already exists.
    pub async fn enqueue_chat(
        &self,
        owner_user: &str,
        chat_id: i64,
        chat_space_id: i64,
        priority: i32,
        anchor_message_id: Option<i64>,
    ) -> Result<BackfillJob, CoreError> {
        if let Some(existing) = backfill::find(&self.pool, owner_user, chat_id, chat_space_id).await? {
            if existing.completed_at.is_none() {
                return Ok(existing);
            }
        }
        let job = backfill::enqueue(
            &self.pool,
            &NewBackfillJob {
                owner_user: owner_user.to_string(),
                priority,
                chat_id,
                chat_space_id,
                anchor_message_id,
                batch_size: self.settings.default_batch_size,
                inter_batch_delay: self.settings.default_inter_batch_delay_secs,
                max_batches: self.settings.default_max_batches,
            },
        )
        .await?;
        tracing::info!(job_id = job.id, owner = owner_user, chat_id, "backfill: job queued");
        Ok(job)
    }

    /// Signal every running job of `owner_user` to stop after its current
    /// batch. Returns how many jobs were signalled.
    pub fn cancel_owner(&self, owner_user: &str) -> usize {
        self.cancel_where(|job| job.owner_user == owner_user)
    }

    pub fn cancel_chat(&self, chat_id: i64, chat_space_id: i64) -> usize {
        self.cancel_where(|job| job.chat_id == chat_id && job.chat_space_id == chat_space_id)
    }

    fn cancel_where(&self, matches: impl Fn(&RunningJob) -> bool) -> usize {
        let mut cancelled = 0;
        for entry in self.running.iter() {
            if matches(entry.value()) {
                entry.value().cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn owner_busy(&self, owner_user: &str) -> bool {
        self.running.iter().any(|entry| entry.value().owner_user == owner_user)
    }

    fn track(&self, job: &BackfillJob, parent: &CancellationToken) -> CancellationToken {
        let cancel = parent.child_token();
        self.running.insert(
            job.id,
            RunningJob {
                owner_user: job.owner_user.clone(),
                chat_id: job.chat_id,
                chat_space_id: job.chat_space_id,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Claim and run the next eligible job of `owner_user` on the current task.
    pub async fn run_next(
        &self,
        owner_user: &str,
        parent: &CancellationToken,
    ) -> Result<Option<JobOutcome>, CoreError> {
        let Some(job) =
            backfill::next_eligible(&self.pool, owner_user, now_ms(), self.stale_after_ms()).await?
        else {
            return Ok(None);
        };
        let job_id = job.id;
        let cancel = self.track(&job, parent);
        let result = self.run_job(job, &cancel).await;
        self.running.remove(&job_id);
        result.map(Some)
    }

    /// Claim one job for every owner that has an eligible job and no job
    /// running yet, and run each on its own task. Returns how many started.
    pub async fn dispatch_once(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<usize, CoreError> {
        let now = now_ms();
        let owners = backfill::owners_with_eligible(&self.pool, now, self.stale_after_ms()).await?;
        let mut started = 0;
        for owner in owners {
            if self.owner_busy(&owner) {
                continue;
            }
            let Some(job) =
                backfill::next_eligible(&self.pool, &owner, now, self.stale_after_ms()).await?
            else {
                continue;
            };
            let cancel = self.track(&job, shutdown);
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let job_id = job.id;
                match worker.run_job(job, &cancel).await {
                    Ok(outcome) => tracing::debug!(job_id, ?outcome, "backfill: job finished"),
                    Err(e) => tracing::warn!(job_id, "backfill: job failed: {}", e),
                }
                worker.running.remove(&job_id);
            });
            started += 1;
        }
        Ok(started)
    }

    /// Run the polling loop until `shutdown` fires. Running jobs observe the
    /// same signal through child tokens and go back to pending.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let every = self.settings.poll_interval.max(MIN_POLL_INTERVAL);
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                poll_interval_secs = self.settings.poll_interval.as_secs(),
                "backfill: worker started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.dispatch_once(&shutdown).await {
                            tracing::warn!("backfill: dispatch error: {}", e);
                        }
                    }
                }
            }
            tracing::info!("backfill: worker stopped");
        })
    }

    /// Execute one claimed job to an outcome. The caller owns the claim.
    ///
    /// On a storage error the claim is released before the error is
    /// returned, so the job does not sit dispatched until it goes stale.
    pub async fn run_job(
        &self,
        job: BackfillJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, CoreError> {
        let job_id = job.id;
        match self.drive(job, cancel).await {
            Err(CoreError::Storage(DbError::NotFound)) => {
                tracing::info!(job_id, "backfill: job removed while running");
                Ok(JobOutcome::Removed)
            }
            Err(e) => {
                match backfill::release(&self.pool, job_id).await {
                    Ok(()) | Err(DbError::NotFound) => {}
                    Err(release_err) => {
                        tracing::warn!(job_id, "backfill: release after error failed: {}", release_err)
                    }
                }
                Err(e)
            }
            outcome => outcome,
        }
    }

    async fn drive(
        &self,
        job: BackfillJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, CoreError> {
        let limit = usize::try_from(job.batch_size.max(1)).unwrap_or(1);
        let delay = Duration::from_secs(u64::try_from(job.inter_batch_delay).unwrap_or(0));
        let mut anchor = job.anchor_message_id;
        let mut batches = 0;
        let mut imported = 0u64;

        loop {
            if cancel.is_cancelled() {
                return self.abandon(&job, batches).await;
            }

            let batch = match self.client.fetch_batch(&job, anchor, limit).await {
                Ok(batch) => batch,
                Err(HistoryError::RateLimited { retry_after_secs }) => {
                    let seconds = retry_after_secs.unwrap_or(self.settings.rate_limit_cooldown_secs);
                    let cooldown = i64::try_from(seconds).unwrap_or(i64::MAX);
                    backfill::set_cooldown(&self.pool, job.id, cooldown, now_ms()).await?;
                    tracing::info!(job_id = job.id, seconds, "backfill: rate limited, cooling down");
                    return Ok(JobOutcome::CoolingDown { seconds });
                }
                Err(HistoryError::Transient(reason)) => {
                    backfill::release(&self.pool, job.id).await?;
                    tracing::warn!(job_id = job.id, "backfill: transient error, job released: {}", reason);
                    return Ok(JobOutcome::Released { reason });
                }
            };

            for record in &batch.messages {
                if messages::put_if_absent(&self.pool, record).await? {
                    imported += 1;
                }
            }
            batches += 1;
            tracing::debug!(
                job_id = job.id,
                batch = batches,
                fetched = batch.messages.len(),
                "backfill: batch stored"
            );

            let exhausted = batch.messages.is_empty() || batch.next_anchor.is_none();
            if let Some(next) = batch.next_anchor {
                backfill::update_anchor(&self.pool, job.id, next).await?;
                anchor = Some(next);
            }
            if exhausted || (!job.is_unbounded() && batches >= job.max_batches) {
                backfill::mark_done(&self.pool, job.id, now_ms()).await?;
                tracing::info!(job_id = job.id, batches, imported, "backfill: job complete");
                return Ok(JobOutcome::Completed { batches, imported });
            }

            // Keep the claim fresh for long jobs.
            backfill::mark_dispatched(&self.pool, job.id, now_ms()).await?;

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return self.abandon(&job, batches).await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn abandon(&self, job: &BackfillJob, batches: i32) -> Result<JobOutcome, CoreError> {
        backfill::release(&self.pool, job.id).await?;
        tracing::info!(job_id = job.id, batches, "backfill: job cancelled, left pending");
        Ok(JobOutcome::Cancelled { batches })
    }
}
