//! Database models

use crate::utils::{parse_datetime_or_now, parse_optional_datetime};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::fmt;
use uuid::Uuid;

/// Account status
///
/// Persisted as an integer column: `1` for active, `0` for disabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            UserStatus::Active => 1,
            UserStatus::Disabled => 0,
        }
    }

    /// Any value other than `1` is treated as disabled
    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            UserStatus::Active
        } else {
            UserStatus::Disabled
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UserStatus::Active)
    }
}

/// Public user identity
///
/// Never carries the password hash or salt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub username: String,
    pub nickname: String,
    pub status: UserStatus,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_multi_login: bool,
    pub join_time: DateTime<Utc>,
    pub last_login_time: Option<DateTime<Utc>>,
    pub last_password_changed_time: DateTime<Utc>,
}

/// Full `sys_user` row, including credential material
#[derive(Clone)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
    pub salt: Vec<u8>,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("user", &self.user)
            .field("password_hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

/// New user (for insertion)
///
/// The caller supplies an already derived hash and its salt.
#[derive(Clone)]
pub struct NewUser {
    pub username: String,
    pub nickname: Option<String>,
    pub password_hash: String,
    pub salt: Vec<u8>,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_multi_login: bool,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("nickname", &self.nickname)
            .field("is_superuser", &self.is_superuser)
            .field("is_staff", &self.is_staff)
            .field("is_multi_login", &self.is_multi_login)
            .finish_non_exhaustive()
    }
}

/// Capability and login-policy flags (for partial updates)
#[derive(Debug, Clone, Default)]
pub struct UpdateUserFlags {
    pub is_superuser: Option<bool>,
    pub is_staff: Option<bool>,
    pub is_multi_login: Option<bool>,
}

// ==================== TryFrom Implementations ====================

impl TryFrom<&sqlx::sqlite::SqliteRow> for User {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        let uuid_str: String = row.try_get("uuid")?;
        let uuid = Uuid::parse_str(&uuid_str).map_err(|e| sqlx::Error::ColumnDecode {
            index: "uuid".to_string(),
            source: Box::new(e),
        })?;
        let status: i64 = row.try_get("status")?;
        Ok(User {
            id: row.try_get("id")?,
            uuid,
            username: row.try_get("username")?,
            nickname: row.try_get("nickname")?,
            status: UserStatus::from_i64(status),
            is_superuser: row.try_get("is_superuser")?,
            is_staff: row.try_get("is_staff")?,
            is_multi_login: row.try_get("is_multi_login")?,
            join_time: parse_datetime_or_now(&row.try_get::<String, _>("join_time")?),
            last_login_time: parse_optional_datetime(
                row.try_get::<Option<String>, _>("last_login_time")?,
            ),
            last_password_changed_time: parse_datetime_or_now(
                &row.try_get::<String, _>("last_password_changed_time")?,
            ),
        })
    }
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for UserRecord {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        Ok(UserRecord {
            user: User::try_from(row)?,
            password_hash: row.try_get("password")?,
            salt: row.try_get("salt")?,
        })
    }
}
