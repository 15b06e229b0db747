//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A compare-and-swap lost against a concurrent writer.
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for isoforge_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => isoforge_core::Error::NotFound(msg),
            DbError::Duplicate(msg) | DbError::Conflict(msg) => isoforge_core::Error::Conflict(msg),
            other => isoforge_core::Error::Storage(other.to_string()),
        }
    }
}
