use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(#[from] relaybridge_db::DbError),
    #[error("send lock required but no account given")]
    MissingAccount,
    #[error("remote error: {0}")]
    Remote(String),
}
