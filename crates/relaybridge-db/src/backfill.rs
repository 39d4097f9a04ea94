//! Durable queue of history-import jobs, one logical queue per owner.
//!
//! A job is eligible when it is not completed, was never dispatched or was
//! dispatched at least `stale_after_ms` ago, and is not cooling down.
//! All timestamps are epoch milliseconds supplied by the caller.

use crate::{DbError, DbPool};
use relaybridge_models::backfill::{BackfillJob, NewBackfillJob};
use sqlx::Row;

macro_rules! job_columns {
    () => {
        "id, owner_user, priority, chat_id, chat_space_id, anchor_message_id, batch_size, inter_batch_delay, max_batches, dispatched_at, completed_at, cooldown_until"
    };
}

struct JobRow(BackfillJob);

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for JobRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self(BackfillJob {
            id: row.try_get("id")?,
            owner_user: row.try_get("owner_user")?,
            priority: row.try_get("priority")?,
            chat_id: row.try_get("chat_id")?,
            chat_space_id: row.try_get("chat_space_id")?,
            anchor_message_id: row.try_get("anchor_message_id")?,
            batch_size: row.try_get("batch_size")?,
            inter_batch_delay: row.try_get("inter_batch_delay")?,
            max_batches: row.try_get("max_batches")?,
            dispatched_at: row.try_get("dispatched_at")?,
            completed_at: row.try_get("completed_at")?,
            cooldown_until: row.try_get("cooldown_until")?,
        }))
    }
}

pub async fn enqueue(pool: &DbPool, job: &NewBackfillJob) -> Result<BackfillJob, DbError> {
    let row = sqlx::query_as::<_, JobRow>(concat!(
        "INSERT INTO backfill_queue (owner_user, priority, chat_id, chat_space_id, anchor_message_id, batch_size, inter_batch_delay, max_batches)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING ",
        job_columns!()
    ))
    .bind(&job.owner_user)
    .bind(job.priority)
    .bind(job.chat_id)
    .bind(job.chat_space_id)
    .bind(job.anchor_message_id)
    .bind(job.batch_size)
    .bind(job.inter_batch_delay)
    .bind(job.max_batches)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Claim the most urgent eligible job of `owner_user`.
///
/// Selection and the `dispatched_at` stamp happen in one conditional update,
/// so two workers racing for the same owner never receive the same job.
/// Ties on priority are broken by insertion order.
pub async fn next_eligible(
    pool: &DbPool,
    owner_user: &str,
    now_ms: i64,
    stale_after_ms: i64,
) -> Result<Option<BackfillJob>, DbError> {
    let stale_before = now_ms.saturating_sub(stale_after_ms);
    let row = sqlx::query_as::<_, JobRow>(concat!(
        "UPDATE backfill_queue SET dispatched_at = $2
         WHERE id = (
             SELECT id FROM backfill_queue
             WHERE owner_user = $1
               AND completed_at IS NULL
               AND (dispatched_at IS NULL OR dispatched_at <= $3)
               AND (cooldown_until IS NULL OR cooldown_until <= $2)
             ORDER BY priority ASC, id ASC
             LIMIT 1
         )
           AND completed_at IS NULL
           AND (dispatched_at IS NULL OR dispatched_at <= $3)
           AND (cooldown_until IS NULL OR cooldown_until <= $2)
         RETURNING ",
        job_columns!()
    ))
    .bind(owner_user)
    .bind(now_ms)
    .bind(stale_before)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Owners that currently have at least one eligible job.
pub async fn owners_with_eligible(
    pool: &DbPool,
    now_ms: i64,
    stale_after_ms: i64,
) -> Result<Vec<String>, DbError> {
    let stale_before = now_ms.saturating_sub(stale_after_ms);
    let owners: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT owner_user FROM backfill_queue
         WHERE completed_at IS NULL
           AND (dispatched_at IS NULL OR dispatched_at <= $2)
           AND (cooldown_until IS NULL OR cooldown_until <= $1)
         ORDER BY owner_user ASC",
    )
    .bind(now_ms)
    .bind(stale_before)
    .fetch_all(pool)
    .await?;
    Ok(owners)
}

/// The newest job for a chat pairing, whatever its state.
pub async fn find(
    pool: &DbPool,
    owner_user: &str,
    chat_id: i64,
    chat_space_id: i64,
) -> Result<Option<BackfillJob>, DbError> {
    let row = sqlx::query_as::<_, JobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM backfill_queue
         WHERE owner_user = $1 AND chat_id = $2 AND chat_space_id = $3
         ORDER BY id DESC
         LIMIT 1"
    ))
    .bind(owner_user)
    .bind(chat_id)
    .bind(chat_space_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

pub async fn get(pool: &DbPool, id: i64) -> Result<Option<BackfillJob>, DbError> {
    let row = sqlx::query_as::<_, JobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM backfill_queue WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

pub async fn list_for_owner(pool: &DbPool, owner_user: &str) -> Result<Vec<BackfillJob>, DbError> {
    let rows = sqlx::query_as::<_, JobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM backfill_queue WHERE owner_user = $1 ORDER BY priority ASC, id ASC"
    ))
    .bind(owner_user)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

async fn update_job(pool: &DbPool, sql: &str, id: i64, value: Option<i64>) -> Result<(), DbError> {
    let rows = sqlx::query(sql)
        .bind(id)
        .bind(value)
        .execute(pool)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Stamp a dispatch explicitly, also used as a heartbeat by long-running
/// workers so their claim does not go stale.
pub async fn mark_dispatched(pool: &DbPool, id: i64, now_ms: i64) -> Result<(), DbError> {
    update_job(
        pool,
        "UPDATE backfill_queue SET dispatched_at = $2 WHERE id = $1",
        id,
        Some(now_ms),
    )
    .await
}

pub async fn mark_done(pool: &DbPool, id: i64, now_ms: i64) -> Result<(), DbError> {
    update_job(
        pool,
        "UPDATE backfill_queue SET completed_at = $2 WHERE id = $1",
        id,
        Some(now_ms),
    )
    .await
}

/// Take the job out of rotation for `seconds` after a rate-limit signal. The
/// current dispatch is released, so once the cooldown elapses the job is
/// pending again without waiting for staleness.
pub async fn set_cooldown(pool: &DbPool, id: i64, seconds: i64, now_ms: i64) -> Result<(), DbError> {
    let until = now_ms.saturating_add(seconds.max(0).saturating_mul(1000));
    update_job(
        pool,
        "UPDATE backfill_queue SET cooldown_until = $2, dispatched_at = NULL WHERE id = $1",
        id,
        Some(until),
    )
    .await
}

/// Return a dispatched job to pending, e.g. after a transient failure or a
/// cancelled run.
pub async fn release(pool: &DbPool, id: i64) -> Result<(), DbError> {
    update_job(
        pool,
        "UPDATE backfill_queue SET dispatched_at = $2 WHERE id = $1",
        id,
        None,
    )
    .await
}

/// Persist pagination progress so a resumed job continues where it stopped.
pub async fn update_anchor(pool: &DbPool, id: i64, anchor_message_id: i64) -> Result<(), DbError> {
    update_job(
        pool,
        "UPDATE backfill_queue SET anchor_message_id = $2 WHERE id = $1",
        id,
        Some(anchor_message_id),
    )
    .await
}

pub async fn delete(pool: &DbPool, id: i64) -> Result<bool, DbError> {
    let rows = sqlx::query("DELETE FROM backfill_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn delete_all(pool: &DbPool, owner_user: &str) -> Result<u64, DbError> {
    let rows = sqlx::query("DELETE FROM backfill_queue WHERE owner_user = $1")
        .bind(owner_user)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

pub async fn delete_for_chat(pool: &DbPool, chat_id: i64, chat_space_id: i64) -> Result<u64, DbError> {
    let rows = sqlx::query("DELETE FROM backfill_queue WHERE chat_id = $1 AND chat_space_id = $2")
        .bind(chat_id)
        .bind(chat_space_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    const OWNER: &str = "@alice:example.org";
    const STALE: i64 = 15 * 60 * 1000;

    fn new_job(priority: i32, chat_id: i64) -> NewBackfillJob {
        NewBackfillJob {
            owner_user: OWNER.into(),
            priority,
            chat_id,
            chat_space_id: chat_id,
            anchor_message_id: None,
            batch_size: 50,
            inter_batch_delay: 0,
            max_batches: 3,
        }
    }

    #[tokio::test]
    async fn dispatch_then_done_lifecycle() {
        let pool = test_pool().await;
        let job = enqueue(&pool, &new_job(1, 100)).await.unwrap();
        assert!(job.id > 0);
        assert!(job.dispatched_at.is_none());

        let now = 1_000_000;
        let claimed = next_eligible(&pool, OWNER, now, STALE).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.dispatched_at, Some(now));
        assert_eq!(claimed.batch_size, 50);
        assert_eq!(claimed.max_batches, 3);

        mark_dispatched(&pool, job.id, now + 10).await.unwrap();
        assert!(next_eligible(&pool, OWNER, now + 20, STALE)
            .await
            .unwrap()
            .is_none());

        mark_done(&pool, job.id, now + 30).await.unwrap();
        assert!(next_eligible(&pool, OWNER, now + 40, STALE)
            .await
            .unwrap()
            .is_none());
        assert!(next_eligible(&pool, OWNER, now + STALE * 10, STALE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn priority_then_insertion_order() {
        let pool = test_pool().await;
        let late_urgent = new_job(0, 3);
        let first = enqueue(&pool, &new_job(5, 1)).await.unwrap();
        let second = enqueue(&pool, &new_job(5, 2)).await.unwrap();
        let urgent = enqueue(&pool, &late_urgent).await.unwrap();

        let now = 10;
        let order: Vec<i64> = [
            next_eligible(&pool, OWNER, now, STALE).await.unwrap(),
            next_eligible(&pool, OWNER, now, STALE).await.unwrap(),
            next_eligible(&pool, OWNER, now, STALE).await.unwrap(),
        ]
        .into_iter()
        .map(|job| job.unwrap().id)
        .collect();
        assert_eq!(order, vec![urgent.id, first.id, second.id]);
        assert!(next_eligible(&pool, OWNER, now, STALE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_dispatch_becomes_eligible_again() {
        let pool = test_pool().await;
        let job = enqueue(&pool, &new_job(1, 100)).await.unwrap();
        let t = 5_000_000;
        mark_dispatched(&pool, job.id, t).await.unwrap();

        assert!(next_eligible(&pool, OWNER, t + STALE - 1, STALE)
            .await
            .unwrap()
            .is_none());
        let reclaimed = next_eligible(&pool, OWNER, t + STALE, STALE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.dispatched_at, Some(t + STALE));
    }

    #[tokio::test]
    async fn cooldown_beats_staleness() {
        let pool = test_pool().await;
        let job = enqueue(&pool, &new_job(1, 100)).await.unwrap();
        let t = 0;
        next_eligible(&pool, OWNER, t, STALE).await.unwrap().unwrap();
        set_cooldown(&pool, job.id, 3_600, t).await.unwrap();

        assert!(next_eligible(&pool, OWNER, t + STALE * 2, STALE)
            .await
            .unwrap()
            .is_none());
        assert!(owners_with_eligible(&pool, t + STALE * 2, STALE)
            .await
            .unwrap()
            .is_empty());

        let after = next_eligible(&pool, OWNER, 3_600_000, STALE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.id, job.id);
    }

    #[tokio::test]
    async fn release_and_anchor_progress() {
        let pool = test_pool().await;
        let job = enqueue(&pool, &new_job(1, 100)).await.unwrap();
        next_eligible(&pool, OWNER, 1, STALE).await.unwrap().unwrap();
        update_anchor(&pool, job.id, 4_321).await.unwrap();
        release(&pool, job.id).await.unwrap();

        let again = next_eligible(&pool, OWNER, 2, STALE).await.unwrap().unwrap();
        assert_eq!(again.anchor_message_id, Some(4_321));

        assert!(matches!(
            mark_done(&pool, 9_999, 3).await.unwrap_err(),
            DbError::NotFound
        ));
    }

    #[tokio::test]
    async fn find_and_delete_scopes() {
        let pool = test_pool().await;
        enqueue(&pool, &new_job(1, 100)).await.unwrap();
        enqueue(&pool, &new_job(1, 200)).await.unwrap();
        let mut other = new_job(1, 100);
        other.owner_user = "@bob:example.org".into();
        enqueue(&pool, &other).await.unwrap();

        let found = find(&pool, OWNER, 100, 100).await.unwrap().unwrap();
        assert_eq!(found.chat_id, 100);
        assert!(find(&pool, OWNER, 300, 300).await.unwrap().is_none());

        assert_eq!(
            owners_with_eligible(&pool, 0, STALE).await.unwrap(),
            vec!["@alice:example.org".to_string(), "@bob:example.org".to_string()]
        );

        assert_eq!(delete_for_chat(&pool, 100, 100).await.unwrap(), 2);
        assert_eq!(list_for_owner(&pool, OWNER).await.unwrap().len(), 1);
        assert_eq!(delete_all(&pool, OWNER).await.unwrap(), 1);
        assert!(get(&pool, found.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_a_job_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("queue.db").to_string_lossy()
        );
        let pool = crate::create_pool(&url, 4).await.expect("pool");
        crate::run_migrations(&pool).await.expect("migrations");
        let job = enqueue(&pool, &new_job(1, 100)).await.unwrap();

        let (a, b) = tokio::join!(
            next_eligible(&pool, OWNER, 100, STALE),
            next_eligible(&pool, OWNER, 100, STALE)
        );
        let claims: Vec<BackfillJob> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, job.id);
    }
}
