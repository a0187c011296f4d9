//! Authentication error types

use sysgate_db::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Unknown username or wrong password; the two are never distinguished
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Session invalid")]
    SessionInvalid,

    #[error("Insufficient capability")]
    InsufficientCapability,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Salt already in use by another user")]
    DuplicateSalt,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DbError> for AuthError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => AuthError::NotFound(what),
            DbError::Duplicate(what) => AuthError::Duplicate(what),
            DbError::DuplicateSalt => AuthError::DuplicateSalt,
            DbError::Connection(e) => AuthError::StorageUnavailable(e.to_string()),
            DbError::Migration(e) => AuthError::StorageUnavailable(e),
        }
    }
}

impl AuthError {
    /// Whether this error represents a failed collaborator rather than a decision
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, AuthError::StorageUnavailable(_))
    }
}
