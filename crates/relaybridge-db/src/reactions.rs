use crate::{DbError, DbPool};
use relaybridge_models::reaction::ReactionRecord;
use sqlx::Row;

struct ReactionRow(ReactionRecord);

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ReactionRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self(ReactionRecord {
            local_event_id: row.try_get("local_event_id")?,
            local_room_id: row.try_get("local_room_id")?,
            target_local_event_id: row.try_get("target_local_event_id")?,
            remote_sender_id: row.try_get("remote_sender_id")?,
            reaction: row.try_get("reaction")?,
        }))
    }
}

/// Store a bridged reaction, replacing the local event of an identical
/// reaction from the same sender.
pub async fn put(pool: &DbPool, record: &ReactionRecord) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO reaction (local_event_id, local_room_id, target_local_event_id, remote_sender_id, reaction)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (target_local_event_id, local_room_id, remote_sender_id, reaction) DO UPDATE SET
             local_event_id = EXCLUDED.local_event_id",
    )
    .bind(&record.local_event_id)
    .bind(&record.local_room_id)
    .bind(&record.target_local_event_id)
    .bind(record.remote_sender_id)
    .bind(&record.reaction)
    .execute(pool)
    .await?;
    Ok(())
}

/// All reactions one remote sender left on a local event.
pub async fn get_by_sender(
    pool: &DbPool,
    target_local_event_id: &str,
    local_room_id: &str,
    remote_sender_id: i64,
) -> Result<Vec<ReactionRecord>, DbError> {
    let rows = sqlx::query_as::<_, ReactionRow>(
        "SELECT local_event_id, local_room_id, target_local_event_id, remote_sender_id, reaction
         FROM reaction
         WHERE target_local_event_id = $1 AND local_room_id = $2 AND remote_sender_id = $3
         ORDER BY reaction ASC",
    )
    .bind(target_local_event_id)
    .bind(local_room_id)
    .bind(remote_sender_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn list_for_target(
    pool: &DbPool,
    target_local_event_id: &str,
    local_room_id: &str,
) -> Result<Vec<ReactionRecord>, DbError> {
    let rows = sqlx::query_as::<_, ReactionRow>(
        "SELECT local_event_id, local_room_id, target_local_event_id, remote_sender_id, reaction
         FROM reaction
         WHERE target_local_event_id = $1 AND local_room_id = $2
         ORDER BY remote_sender_id ASC, reaction ASC",
    )
    .bind(target_local_event_id)
    .bind(local_room_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn delete(pool: &DbPool, record: &ReactionRecord) -> Result<bool, DbError> {
    let rows = sqlx::query(
        "DELETE FROM reaction
         WHERE target_local_event_id = $1 AND local_room_id = $2 AND remote_sender_id = $3 AND reaction = $4",
    )
    .bind(&record.target_local_event_id)
    .bind(&record.local_room_id)
    .bind(record.remote_sender_id)
    .bind(&record.reaction)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn delete_all_for_room(pool: &DbPool, local_room_id: &str) -> Result<u64, DbError> {
    let rows = sqlx::query("DELETE FROM reaction WHERE local_room_id = $1")
        .bind(local_room_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}
