//! User operations

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{NewUser, UpdateUserFlags, User, UserRecord, UserStatus};
use crate::repository::Database;

const USER_COLUMNS: &str = "id, uuid, username, nickname, password, salt, status, is_superuser, \
     is_staff, is_multi_login, join_time, last_login_time, last_password_changed_time";

impl Database {
    // ==================== User Operations ====================

    /// Insert a new user
    ///
    /// Fails with [`DbError::Duplicate`] for a taken username and
    /// [`DbError::DuplicateSalt`] when the salt is already stored for someone else.
    pub async fn insert_user(&self, user: NewUser) -> Result<User, DbError> {
        let now = Utc::now();
        let uuid = Uuid::new_v4();
        let nickname = user.nickname.clone().unwrap_or_else(|| user.username.clone());

        let result = sqlx::query(
            r#"
            INSERT INTO sys_user (
                uuid, username, nickname, password, salt, status,
                is_superuser, is_staff, is_multi_login,
                join_time, last_login_time, last_password_changed_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            RETURNING id
            "#,
        )
        .bind(uuid.to_string())
        .bind(&user.username)
        .bind(&nickname)
        .bind(&user.password_hash)
        .bind(&user.salt)
        .bind(UserStatus::Active.as_i64())
        .bind(user.is_superuser)
        .bind(user.is_staff)
        .bind(user.is_multi_login)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DbError::from_write(e, &format!("User '{}' already exists", user.username))
        })?;

        let id: i64 = result.get("id");

        Ok(User {
            id,
            uuid,
            username: user.username,
            nickname,
            status: UserStatus::Active,
            is_superuser: user.is_superuser,
            is_staff: user.is_staff,
            is_multi_login: user.is_multi_login,
            join_time: now,
            last_login_time: None,
            last_password_changed_time: now,
        })
    }

    /// Get a user (with credentials) by username
    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, DbError> {
        let result = sqlx::query(&format!(
            "SELECT {} FROM sys_user WHERE username = ?",
            USER_COLUMNS
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        result
            .map(|row| UserRecord::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Get a user (with credentials) by ID
    pub async fn get_user_by_id(&self, id: i64) -> Result<Option<UserRecord>, DbError> {
        let result = sqlx::query(&format!("SELECT {} FROM sys_user WHERE id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| UserRecord::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// List all users
    pub async fn list_users(&self) -> Result<Vec<User>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sys_user ORDER BY username",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| User::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Replace a user's password hash and salt
    ///
    /// Hash, salt and `last_password_changed_time` change in one statement.
    pub async fn update_user_password(
        &self,
        id: i64,
        password_hash: &str,
        salt: &[u8],
    ) -> Result<bool, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sys_user
            SET password = ?, salt = ?, last_password_changed_time = ?
            WHERE id = ?
            "#,
        )
        .bind(password_hash)
        .bind(salt)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_write(e, &format!("user {}", id)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Update account status
    pub async fn update_user_status(&self, id: i64, status: UserStatus) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE sys_user SET status = ? WHERE id = ?")
            .bind(status.as_i64())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update capability and login-policy flags; `None` fields are left untouched
    pub async fn update_user_flags(&self, id: i64, flags: UpdateUserFlags) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE sys_user
            SET is_superuser = COALESCE(?, is_superuser),
                is_staff = COALESCE(?, is_staff),
                is_multi_login = COALESCE(?, is_multi_login)
            WHERE id = ?
            "#,
        )
        .bind(flags.is_superuser)
        .bind(flags.is_staff)
        .bind(flags.is_multi_login)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the time of a successful login
    pub async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE sys_user SET last_login_time = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Check if any users exist
    pub async fn has_users(&self) -> Result<bool, DbError> {
        let result = sqlx::query("SELECT COUNT(*) as count FROM sys_user")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = result.get("count");
        Ok(count > 0)
    }
}
