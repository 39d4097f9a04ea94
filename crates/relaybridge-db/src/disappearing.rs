//! Durable schedule of per-message deletion deadlines.

use crate::{DbError, DbPool};
use relaybridge_models::disappearing::DisappearingMessage;
use sqlx::Row;

struct DisappearingRow(DisappearingMessage);

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for DisappearingRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self(DisappearingMessage {
            room_id: row.try_get("room_id")?,
            event_id: row.try_get("event_id")?,
            expiration_seconds: row.try_get("expiration_seconds")?,
            expiration_ts: row.try_get("expiration_ts")?,
            unqueued_ts: row.try_get("unqueued_ts")?,
        }))
    }
}

/// Insert an entry, superseding any earlier deadline for the same event.
pub async fn schedule(pool: &DbPool, entry: &DisappearingMessage) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO disappearing_message (room_id, event_id, expiration_seconds, expiration_ts, unqueued_ts)
         VALUES ($1, $2, $3, $4, NULL)
         ON CONFLICT (room_id, event_id) DO UPDATE SET
             expiration_seconds = EXCLUDED.expiration_seconds,
             expiration_ts = EXCLUDED.expiration_ts,
             unqueued_ts = NULL",
    )
    .bind(&entry.room_id)
    .bind(&entry.event_id)
    .bind(entry.expiration_seconds)
    .bind(entry.expiration_ts)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move the deadline of an existing entry. The entry becomes unclaimed again
/// so the next poll after the new deadline emits it.
pub async fn reschedule(
    pool: &DbPool,
    room_id: &str,
    event_id: &str,
    new_expiration_ts: i64,
) -> Result<(), DbError> {
    let rows = sqlx::query(
        "UPDATE disappearing_message SET expiration_ts = $3, unqueued_ts = NULL
         WHERE room_id = $1 AND event_id = $2",
    )
    .bind(room_id)
    .bind(event_id)
    .bind(new_expiration_ts)
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn cancel(pool: &DbPool, room_id: &str, event_id: &str) -> Result<bool, DbError> {
    let rows = sqlx::query("DELETE FROM disappearing_message WHERE room_id = $1 AND event_id = $2")
        .bind(room_id)
        .bind(event_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn get(
    pool: &DbPool,
    room_id: &str,
    event_id: &str,
) -> Result<Option<DisappearingMessage>, DbError> {
    let row = sqlx::query_as::<_, DisappearingRow>(
        "SELECT room_id, event_id, expiration_seconds, expiration_ts, unqueued_ts
         FROM disappearing_message
         WHERE room_id = $1 AND event_id = $2",
    )
    .bind(room_id)
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

pub async fn delete_all_for_room(pool: &DbPool, room_id: &str) -> Result<u64, DbError> {
    let rows = sqlx::query("DELETE FROM disappearing_message WHERE room_id = $1")
        .bind(room_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

/// Claim every entry whose deadline has passed.
///
/// With `poll_interval_seconds = None` (startup) every due entry is returned.
/// Otherwise an entry that was already handed out within the last
/// `poll_interval_seconds` is held back. Returned entries are stamped with
/// `now_ms` in the same statement, so overlapping polls never share an entry.
pub async fn poll_due(
    pool: &DbPool,
    now_ms: i64,
    poll_interval_seconds: Option<u64>,
) -> Result<Vec<DisappearingMessage>, DbError> {
    let rows = match poll_interval_seconds {
        None => {
            sqlx::query_as::<_, DisappearingRow>(
                "UPDATE disappearing_message SET unqueued_ts = $1
                 WHERE expiration_ts <= $1
                 RETURNING room_id, event_id, expiration_seconds, expiration_ts, unqueued_ts",
            )
            .bind(now_ms)
            .fetch_all(pool)
            .await?
        }
        Some(seconds) => {
            let window_ms = i64::try_from(seconds)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            let claimed_before = now_ms.saturating_sub(window_ms);
            sqlx::query_as::<_, DisappearingRow>(
                "UPDATE disappearing_message SET unqueued_ts = $1
                 WHERE expiration_ts <= $1
                   AND (unqueued_ts IS NULL OR unqueued_ts < $2)
                 RETURNING room_id, event_id, expiration_seconds, expiration_ts, unqueued_ts",
            )
            .bind(now_ms)
            .bind(claimed_before)
            .fetch_all(pool)
            .await?
        }
    };

    let mut due: Vec<DisappearingMessage> = rows.into_iter().map(|r| r.0).collect();
    due.sort_by(|a, b| {
        a.expiration_ts
            .cmp(&b.expiration_ts)
            .then_with(|| a.room_id.cmp(&b.room_id))
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    Ok(due)
}
