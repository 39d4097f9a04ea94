pub mod backfill;
pub mod bridge;
pub mod dedup;
pub mod error;
pub mod expiry;
pub mod send_lock;

pub use error::CoreError;

/// Current wall-clock time in epoch milliseconds, the unit every persisted
/// timestamp uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> relaybridge_db::DbPool {
    let pool = relaybridge_db::create_pool("sqlite::memory:", 1).await.unwrap();
    relaybridge_db::run_migrations(&pool).await.unwrap();
    pool
}
