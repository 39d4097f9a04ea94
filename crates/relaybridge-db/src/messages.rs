//! Message identity store: remote message id (+ edit index) <-> local event id.

use crate::{bool_from_any_row, is_unique_violation, DbError, DbPool};
use relaybridge_models::message::MessageRecord;
use sqlx::Row;

const MAX_BULK_REMOTE_IDS: usize = 500;

macro_rules! message_columns {
    () => {
        "remote_msg_id, space, edit_index, local_event_id, local_room_id, redacted, content_hash, sender_local_id, sender_remote_id"
    };
}

struct MessageRow(MessageRecord);

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self(MessageRecord {
            remote_msg_id: row.try_get("remote_msg_id")?,
            space: row.try_get("space")?,
            edit_index: row.try_get("edit_index")?,
            local_event_id: row.try_get("local_event_id")?,
            local_room_id: row.try_get("local_room_id")?,
            redacted: bool_from_any_row(row, "redacted")?,
            content_hash: row.try_get("content_hash")?,
            sender_local_id: row.try_get("sender_local_id")?,
            sender_remote_id: row.try_get("sender_remote_id")?,
        }))
    }
}

/// Insert a freshly bridged message.
///
/// A clash on either key is reported as [`DbError::Conflict`]; it means the
/// message was already bridged and the caller must not post it again.
pub async fn put(pool: &DbPool, record: &MessageRecord) -> Result<(), DbError> {
    let result = sqlx::query(
        "INSERT INTO message (remote_msg_id, space, edit_index, local_event_id, local_room_id, redacted, content_hash, sender_local_id, sender_remote_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(record.remote_msg_id)
    .bind(record.space)
    .bind(record.edit_index)
    .bind(&record.local_event_id)
    .bind(&record.local_room_id)
    .bind(record.redacted)
    .bind(record.content_hash.clone())
    .bind(record.sender_local_id.as_deref())
    .bind(record.sender_remote_id)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(DbError::Conflict(format!(
            "message {}/{} edit {} already mapped",
            record.remote_msg_id, record.space, record.edit_index
        ))),
        Err(err) => Err(DbError::Sqlx(err)),
    }
}

/// Insert unless either key already exists. Returns whether a row was written.
pub async fn put_if_absent(pool: &DbPool, record: &MessageRecord) -> Result<bool, DbError> {
    let rows = sqlx::query(
        "INSERT INTO message (remote_msg_id, space, edit_index, local_event_id, local_room_id, redacted, content_hash, sender_local_id, sender_remote_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT DO NOTHING",
    )
    .bind(record.remote_msg_id)
    .bind(record.space)
    .bind(record.edit_index)
    .bind(&record.local_event_id)
    .bind(&record.local_room_id)
    .bind(record.redacted)
    .bind(record.content_hash.clone())
    .bind(record.sender_local_id.as_deref())
    .bind(record.sender_remote_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Look up one revision of a remote message.
///
/// `edit_index >= 0` addresses a revision directly. A negative index counts
/// back from the newest edit: `-1` is the latest revision, `-2` the one before.
pub async fn get_by_remote(
    pool: &DbPool,
    remote_msg_id: i64,
    space: i64,
    edit_index: i64,
) -> Result<Option<MessageRecord>, DbError> {
    let row = if edit_index < 0 {
        sqlx::query_as::<_, MessageRow>(concat!(
            "SELECT ",
            message_columns!(),
            " FROM message
             WHERE remote_msg_id = $1 AND space = $2
             ORDER BY edit_index DESC
             LIMIT 1 OFFSET $3"
        ))
        .bind(remote_msg_id)
        .bind(space)
        .bind(-edit_index - 1)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as::<_, MessageRow>(concat!(
            "SELECT ",
            message_columns!(),
            " FROM message
             WHERE remote_msg_id = $1 AND space = $2 AND edit_index = $3"
        ))
        .bind(remote_msg_id)
        .bind(space)
        .bind(edit_index)
        .fetch_optional(pool)
        .await?
    };
    Ok(row.map(|r| r.0))
}

/// Every revision of a remote message, oldest first.
pub async fn get_all_by_remote(
    pool: &DbPool,
    remote_msg_id: i64,
    space: i64,
) -> Result<Vec<MessageRecord>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(concat!(
        "SELECT ",
        message_columns!(),
        " FROM message
         WHERE remote_msg_id = $1 AND space = $2
         ORDER BY edit_index ASC"
    ))
    .bind(remote_msg_id)
    .bind(space)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Original (edit index 0) records for a set of remote ids within one space.
pub async fn get_many_by_remote(
    pool: &DbPool,
    remote_msg_ids: &[i64],
    space: i64,
) -> Result<Vec<MessageRecord>, DbError> {
    if remote_msg_ids.is_empty() {
        return Ok(Vec::new());
    }
    if remote_msg_ids.len() > MAX_BULK_REMOTE_IDS {
        return Err(DbError::Sqlx(sqlx::Error::Protocol(
            "too many remote message ids in bulk lookup".to_string(),
        )));
    }
    let placeholders: Vec<String> = (2..=remote_msg_ids.len() + 1)
        .map(|i| format!("${}", i))
        .collect();
    let sql = format!(
        concat!(
            "SELECT ",
            message_columns!(),
            " FROM message WHERE space = $1 AND edit_index = 0 AND remote_msg_id IN ({}) ORDER BY remote_msg_id ASC"
        ),
        placeholders.join(", ")
    );
    let mut query = sqlx::query_as::<_, MessageRow>(&sql).bind(space);
    for id in remote_msg_ids {
        query = query.bind(*id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn get_by_local(
    pool: &DbPool,
    local_event_id: &str,
    local_room_id: &str,
    space: i64,
) -> Result<Option<MessageRecord>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(concat!(
        "SELECT ",
        message_columns!(),
        " FROM message
         WHERE local_event_id = $1 AND local_room_id = $2 AND space = $3"
    ))
    .bind(local_event_id)
    .bind(local_room_id)
    .bind(space)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Newest bridged message in a room for the given space.
pub async fn latest(
    pool: &DbPool,
    local_room_id: &str,
    space: i64,
) -> Result<Option<MessageRecord>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(concat!(
        "SELECT ",
        message_columns!(),
        " FROM message
         WHERE local_room_id = $1 AND space = $2
         ORDER BY remote_msg_id DESC, edit_index DESC
         LIMIT 1"
    ))
    .bind(local_room_id)
    .bind(space)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Index the next edit of a remote message should be stored under.
pub async fn next_edit_index(
    pool: &DbPool,
    remote_msg_id: i64,
    space: i64,
) -> Result<i64, DbError> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(edit_index) FROM message WHERE remote_msg_id = $1 AND space = $2",
    )
    .bind(remote_msg_id)
    .bind(space)
    .fetch_one(pool)
    .await?;
    Ok(current.map_or(0, |index| index + 1))
}

const EDIT_INSERT_ATTEMPTS: usize = 3;

/// Store `record` as the next revision of its remote message, allocating the
/// edit index inside the insert. `record.edit_index` is ignored; the stored
/// index is returned.
///
/// Two writers racing on the same message can still pick the same index on
/// PostgreSQL; the loser retries against the new maximum.
pub async fn put_next_edit(pool: &DbPool, record: &MessageRecord) -> Result<i64, DbError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO message (remote_msg_id, space, edit_index, local_event_id, local_room_id, redacted, content_hash, sender_local_id, sender_remote_id)
             SELECT $1, $2, COALESCE(MAX(edit_index), -1) + 1, $3, $4, $5, $6, $7, $8
             FROM message WHERE remote_msg_id = $1 AND space = $2
             RETURNING edit_index",
        )
        .bind(record.remote_msg_id)
        .bind(record.space)
        .bind(&record.local_event_id)
        .bind(&record.local_room_id)
        .bind(record.redacted)
        .bind(record.content_hash.clone())
        .bind(record.sender_local_id.as_deref())
        .bind(record.sender_remote_id)
        .fetch_one(pool)
        .await;

        match result {
            Ok(index) => return Ok(index),
            Err(err) if is_unique_violation(&err) && attempt < EDIT_INSERT_ATTEMPTS => {
                tracing::debug!(
                    remote_msg_id = record.remote_msg_id,
                    space = record.space,
                    attempt,
                    "messages: edit index taken, retrying"
                );
            }
            Err(err) if is_unique_violation(&err) => {
                return Err(DbError::Conflict(format!(
                    "edit of {}/{} as {} already mapped",
                    record.remote_msg_id, record.space, record.local_event_id
                )))
            }
            Err(err) => return Err(DbError::Sqlx(err)),
        }
    }
}

/// Flag every mapping of a local event as redacted. Returns the number of
/// rows touched (one per space the event was bridged into).
pub async fn mark_redacted(
    pool: &DbPool,
    local_event_id: &str,
    local_room_id: &str,
) -> Result<u64, DbError> {
    let rows = sqlx::query(
        "UPDATE message SET redacted = TRUE
         WHERE local_event_id = $1 AND local_room_id = $2",
    )
    .bind(local_event_id)
    .bind(local_room_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Swap a provisional local event id for the final one.
///
/// Message rows and any reactions that already point at the placeholder are
/// rewritten in one transaction, so readers observe either the old id
/// everywhere or the new id everywhere.
pub async fn replace_placeholder(
    pool: &DbPool,
    old_local_id: &str,
    new_local_id: &str,
    local_room_id: &str,
) -> Result<u64, DbError> {
    let mut tx = pool.begin().await?;

    let updated = match sqlx::query(
        "UPDATE message SET local_event_id = $1
         WHERE local_event_id = $2 AND local_room_id = $3",
    )
    .bind(new_local_id)
    .bind(old_local_id)
    .bind(local_room_id)
    .execute(&mut *tx)
    .await
    {
        Ok(result) => result.rows_affected(),
        Err(err) if is_unique_violation(&err) => {
            return Err(DbError::Conflict(format!(
                "event {new_local_id} is already mapped in {local_room_id}"
            )));
        }
        Err(err) => return Err(DbError::Sqlx(err)),
    };

    if updated == 0 {
        return Err(DbError::NotFound);
    }

    sqlx::query(
        "UPDATE reaction SET target_local_event_id = $1
         WHERE target_local_event_id = $2 AND local_room_id = $3",
    )
    .bind(new_local_id)
    .bind(old_local_id)
    .bind(local_room_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(updated)
}

pub async fn update_content_hash(
    pool: &DbPool,
    record: &MessageRecord,
    content_hash: &[u8],
) -> Result<(), DbError> {
    let rows = sqlx::query(
        "UPDATE message SET content_hash = $4
         WHERE remote_msg_id = $1 AND space = $2 AND edit_index = $3",
    )
    .bind(record.remote_msg_id)
    .bind(record.space)
    .bind(record.edit_index)
    .bind(content_hash.to_vec())
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn delete(pool: &DbPool, record: &MessageRecord) -> Result<bool, DbError> {
    let rows = sqlx::query(
        "DELETE FROM message WHERE remote_msg_id = $1 AND space = $2 AND edit_index = $3",
    )
    .bind(record.remote_msg_id)
    .bind(record.space)
    .bind(record.edit_index)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Drop every mapping of a room, used when the chat pairing is torn down.
pub async fn delete_all_for_room(pool: &DbPool, local_room_id: &str) -> Result<u64, DbError> {
    let rows = sqlx::query("DELETE FROM message WHERE local_room_id = $1")
        .bind(local_room_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

pub async fn count_spaces_in_room(pool: &DbPool, local_room_id: &str) -> Result<i64, DbError> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(DISTINCT space) FROM message WHERE local_room_id = $1")
            .bind(local_room_id)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    const ROOM: &str = "!portal:example.org";
    const SPACE: i64 = 777;

    fn record(remote_msg_id: i64, edit_index: i64, event: &str) -> MessageRecord {
        MessageRecord::new(remote_msg_id, SPACE, event, ROOM).with_edit_index(edit_index)
    }

    #[tokio::test]
    async fn put_and_get_both_directions() {
        let pool = test_pool().await;
        let original = record(10, 0, "$orig")
            .with_sender(Some("@tg_5:example.org".into()), Some(5))
            .with_content_hash(vec![1, 2, 3]);
        put(&pool, &original).await.unwrap();

        let by_remote = get_by_remote(&pool, 10, SPACE, 0).await.unwrap().unwrap();
        assert_eq!(by_remote, original);

        let by_local = get_by_local(&pool, "$orig", ROOM, SPACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_local, original);

        assert!(get_by_local(&pool, "$orig", ROOM, SPACE + 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn same_remote_id_in_two_spaces_does_not_collide() {
        let pool = test_pool().await;
        put(&pool, &MessageRecord::new(10, 1, "$a", ROOM)).await.unwrap();
        put(&pool, &MessageRecord::new(10, 2, "$b", ROOM)).await.unwrap();
        assert_eq!(
            get_by_remote(&pool, 10, 2, 0).await.unwrap().unwrap().local_event_id,
            "$b"
        );
        assert_eq!(count_spaces_in_room(&pool, ROOM).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_put_is_a_conflict() {
        let pool = test_pool().await;
        put(&pool, &record(10, 0, "$orig")).await.unwrap();
        let err = put(&pool, &record(10, 0, "$other")).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        let err = put(&pool, &record(11, 0, "$orig")).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn negative_edit_index_counts_back_from_latest() {
        let pool = test_pool().await;
        for index in 0..=3 {
            put(&pool, &record(42, index, &format!("$edit{index}")))
                .await
                .unwrap();
        }

        let latest = get_by_remote(&pool, 42, SPACE, -1).await.unwrap().unwrap();
        assert_eq!(latest.edit_index, 3);
        let previous = get_by_remote(&pool, 42, SPACE, -2).await.unwrap().unwrap();
        assert_eq!(previous.edit_index, 2);
        let oldest = get_by_remote(&pool, 42, SPACE, -4).await.unwrap().unwrap();
        assert_eq!(oldest.edit_index, 0);
        assert!(get_by_remote(&pool, 42, SPACE, -5).await.unwrap().is_none());

        assert_eq!(next_edit_index(&pool, 42, SPACE).await.unwrap(), 4);
        assert_eq!(next_edit_index(&pool, 43, SPACE).await.unwrap(), 0);

        let all = get_all_by_remote(&pool, 42, SPACE).await.unwrap();
        let indices: Vec<i64> = all.iter().map(|r| r.edit_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn latest_returns_highest_remote_id() {
        let pool = test_pool().await;
        put(&pool, &record(5, 0, "$five")).await.unwrap();
        put(&pool, &record(9, 0, "$nine")).await.unwrap();
        put(&pool, &record(9, 1, "$nine-edit")).await.unwrap();
        put(&pool, &record(7, 0, "$seven")).await.unwrap();

        let last = latest(&pool, ROOM, SPACE).await.unwrap().unwrap();
        assert_eq!(last.local_event_id, "$nine-edit");
        assert!(latest(&pool, "!empty:example.org", SPACE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mark_redacted_flags_record() {
        let pool = test_pool().await;
        put(&pool, &record(1, 0, "$gone")).await.unwrap();
        assert_eq!(mark_redacted(&pool, "$gone", ROOM).await.unwrap(), 1);
        let stored = get_by_remote(&pool, 1, SPACE, 0).await.unwrap().unwrap();
        assert!(stored.redacted);
        assert_eq!(mark_redacted(&pool, "$missing", ROOM).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_placeholder_rewrites_message_and_reactions() {
        let pool = test_pool().await;
        put(&pool, &record(1, 0, "$pending")).await.unwrap();
        crate::reactions::put(
            &pool,
            &relaybridge_models::reaction::ReactionRecord {
                local_event_id: "$reaction".into(),
                local_room_id: ROOM.into(),
                target_local_event_id: "$pending".into(),
                remote_sender_id: 5,
                reaction: "👍".into(),
            },
        )
        .await
        .unwrap();

        let updated = replace_placeholder(&pool, "$pending", "$final", ROOM)
            .await
            .unwrap();
        assert_eq!(updated, 1);

        assert!(get_by_local(&pool, "$pending", ROOM, SPACE)
            .await
            .unwrap()
            .is_none());
        let stored = get_by_local(&pool, "$final", ROOM, SPACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.remote_msg_id, 1);

        let reactions = crate::reactions::list_for_target(&pool, "$final", ROOM)
            .await
            .unwrap();
        assert_eq!(reactions.len(), 1);
    }

    #[tokio::test]
    async fn replace_placeholder_missing_is_not_found() {
        let pool = test_pool().await;
        let err = replace_placeholder(&pool, "$nope", "$final", ROOM)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[tokio::test]
    async fn put_if_absent_never_overwrites() {
        let pool = test_pool().await;
        put(&pool, &record(3, 0, "$live")).await.unwrap();
        assert!(!put_if_absent(&pool, &record(3, 0, "$history")).await.unwrap());
        assert!(put_if_absent(&pool, &record(2, 0, "$older")).await.unwrap());
        assert_eq!(
            get_by_remote(&pool, 3, SPACE, 0).await.unwrap().unwrap().local_event_id,
            "$live"
        );
    }

    #[tokio::test]
    async fn bulk_lookup_and_teardown() {
        let pool = test_pool().await;
        for id in 1..=4 {
            put(&pool, &record(id, 0, &format!("$m{id}"))).await.unwrap();
        }
        put(&pool, &record(2, 1, "$m2-edit")).await.unwrap();

        let found = get_many_by_remote(&pool, &[2, 4, 99], SPACE).await.unwrap();
        let ids: Vec<i64> = found.iter().map(|r| r.remote_msg_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(found.iter().all(|r| r.edit_index == 0));

        update_content_hash(&pool, &found[0], b"digest").await.unwrap();
        assert_eq!(
            get_by_remote(&pool, 2, SPACE, 0)
                .await
                .unwrap()
                .unwrap()
                .content_hash
                .as_deref(),
            Some(&b"digest"[..])
        );

        assert!(delete(&pool, &found[1]).await.unwrap());
        assert_eq!(delete_all_for_room(&pool, ROOM).await.unwrap(), 4);
        assert!(latest(&pool, ROOM, SPACE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_next_edit_allocates_the_index() {
        let pool = test_pool().await;
        put(&pool, &record(8, 0, "$orig")).await.unwrap();
        assert_eq!(put_next_edit(&pool, &record(8, 0, "$e1")).await.unwrap(), 1);
        assert_eq!(put_next_edit(&pool, &record(8, 99, "$e2")).await.unwrap(), 2);
        assert_eq!(put_next_edit(&pool, &record(9, 0, "$fresh")).await.unwrap(), 0);
        assert_eq!(
            get_by_remote(&pool, 8, SPACE, -1).await.unwrap().unwrap().local_event_id,
            "$e2"
        );

        let err = put_next_edit(&pool, &record(8, 0, "$e2")).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_edits_get_distinct_indices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("edits.db").to_string_lossy()
        );
        let pool = crate::create_pool(&url, 4).await.expect("pool");
        crate::run_migrations(&pool).await.expect("migrations");
        put(&pool, &record(8, 0, "$orig")).await.unwrap();

        let (ra, rb, rc) = (record(8, 0, "$a"), record(8, 0, "$b"), record(8, 0, "$c"));
        let (a, b, c) = tokio::join!(
            put_next_edit(&pool, &ra),
            put_next_edit(&pool, &rb),
            put_next_edit(&pool, &rc)
        );
        let mut indices = vec![a.unwrap(), b.unwrap(), c.unwrap()];
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(get_all_by_remote(&pool, 8, SPACE).await.unwrap().len(), 4);
    }
}
