//! Database error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Salt already in use by another user")]
    DuplicateSalt,

    #[error("Migration error: {0}")]
    Migration(String),
}

impl DbError {
    /// Map a unique-constraint violation on `sys_user` into a typed error
    pub(crate) fn from_write(err: sqlx::Error, subject: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            if db_err.message().contains("salt") {
                return DbError::DuplicateSalt;
            }
            return DbError::Duplicate(subject.to_string());
        }
        DbError::Connection(err)
    }
}
