//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("config version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i64, found: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for conveyor_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => conveyor_core::Error::NotFound(msg),
            DbError::VersionMismatch { .. } | DbError::Conflict(_) => {
                conveyor_core::Error::Conflict(err.to_string())
            }
            _ => conveyor_core::Error::Storage(err.to_string()),
        }
    }
}
