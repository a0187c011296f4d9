//! Credential store
//!
//! Persistence sits behind [`UserRepository`]; [`CredentialStore`] layers the
//! session side effects on top so that no credential or status change can
//! leave stale sessions behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use sysgate_db::{Database, NewUser, UpdateUserFlags, User, UserRecord, UserStatus};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::session::SessionRegistry;

/// Persistence collaborator for `sys_user`
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AuthError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, AuthError>;

    async fn insert(&self, user: NewUser) -> Result<User, AuthError>;

    /// Replace hash and salt atomically; `false` if the user does not exist
    async fn update_password(&self, id: i64, hash: &str, salt: &[u8]) -> Result<bool, AuthError>;

    async fn update_status(&self, id: i64, status: UserStatus) -> Result<bool, AuthError>;

    async fn update_flags(&self, id: i64, flags: UpdateUserFlags) -> Result<bool, AuthError>;

    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError>;

    async fn list(&self) -> Result<Vec<User>, AuthError>;

    async fn has_users(&self) -> Result<bool, AuthError>;
}

#[async_trait]
impl UserRepository for Database {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AuthError> {
        Ok(self.get_user_by_username(username).await?)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, AuthError> {
        Ok(self.get_user_by_id(id).await?)
    }

    async fn insert(&self, user: NewUser) -> Result<User, AuthError> {
        Ok(self.insert_user(user).await?)
    }

    async fn update_password(&self, id: i64, hash: &str, salt: &[u8]) -> Result<bool, AuthError> {
        Ok(self.update_user_password(id, hash, salt).await?)
    }

    async fn update_status(&self, id: i64, status: UserStatus) -> Result<bool, AuthError> {
        Ok(self.update_user_status(id, status).await?)
    }

    async fn update_flags(&self, id: i64, flags: UpdateUserFlags) -> Result<bool, AuthError> {
        Ok(self.update_user_flags(id, flags).await?)
    }

    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError> {
        Ok(Database::update_last_login(self, id, at).await?)
    }

    async fn list(&self) -> Result<Vec<User>, AuthError> {
        Ok(self.list_users().await?)
    }

    async fn has_users(&self) -> Result<bool, AuthError> {
        Ok(Database::has_users(self).await?)
    }
}

/// Per-user credentials and status, with session eviction on every change
#[derive(Clone)]
pub struct CredentialStore {
    repo: Arc<dyn UserRepository>,
    sessions: Arc<SessionRegistry>,
    pending_logins: Arc<Mutex<JoinSet<()>>>,
}

impl CredentialStore {
    pub fn new(repo: Arc<dyn UserRepository>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            repo,
            sessions,
            pending_logins: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Look up a user by username
    pub async fn lookup_by_username(&self, username: &str) -> Result<UserRecord, AuthError> {
        self.repo
            .find_by_username(username)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user '{}'", username)))
    }

    /// Look up a user by ID
    pub async fn lookup_by_id(&self, id: i64) -> Result<UserRecord, AuthError> {
        self.repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("user {}", id)))
    }

    /// Store a new user whose hash and salt were derived by the caller
    pub async fn insert_user(&self, user: NewUser) -> Result<User, AuthError> {
        let username = user.username.clone();
        let created = self.repo.insert(user).await?;
        info!("Created user {} (id {})", username, created.id);
        Ok(created)
    }

    /// Replace hash and salt, then revoke every session of the user
    pub async fn update_password(
        &self,
        id: i64,
        new_hash: &str,
        new_salt: &[u8],
    ) -> Result<(), AuthError> {
        if !self.repo.update_password(id, new_hash, new_salt).await? {
            return Err(AuthError::NotFound(format!("user {}", id)));
        }

        let revoked = self.sessions.revoke_all_for_user(id);
        info!(
            "Password changed for user {}, {} session(s) revoked",
            id, revoked
        );
        Ok(())
    }

    /// Change account status
    ///
    /// Disabling blocks and evicts the user's sessions before the write, so no
    /// session outlives the call even if the write itself fails; the block is
    /// only lifted for a user that turns out not to exist.
    pub async fn set_status(&self, id: i64, status: UserStatus) -> Result<(), AuthError> {
        match status {
            UserStatus::Disabled => {
                let revoked = self.sessions.block_user(id);
                match self.repo.update_status(id, status).await {
                    Ok(true) => {
                        info!("Disabled user {}, {} session(s) revoked", id, revoked);
                        Ok(())
                    }
                    Ok(false) => {
                        self.sessions.unblock_user(id);
                        Err(AuthError::NotFound(format!("user {}", id)))
                    }
                    Err(e) => {
                        warn!("Failed to persist disable of user {}: {}", id, e);
                        Err(e)
                    }
                }
            }
            UserStatus::Active => {
                if !self.repo.update_status(id, status).await? {
                    return Err(AuthError::NotFound(format!("user {}", id)));
                }
                self.sessions.unblock_user(id);
                info!("Enabled user {}", id);
                Ok(())
            }
        }
    }

    /// Update capability and login-policy flags
    ///
    /// Policy changes take effect at the next login; existing sessions stay.
    pub async fn set_flags(&self, id: i64, flags: UpdateUserFlags) -> Result<(), AuthError> {
        if !self.repo.update_flags(id, flags).await? {
            return Err(AuthError::NotFound(format!("user {}", id)));
        }
        debug!("Updated flags of user {}", id);
        Ok(())
    }

    /// Record a successful login without holding up the caller
    ///
    /// The write runs on its own task; failures are logged and dropped.
    pub fn record_login(&self, id: i64, at: DateTime<Utc>) {
        let repo = self.repo.clone();
        let mut pending = self.pending_logins.lock();
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            match repo.update_last_login(id, at).await {
                Ok(true) => debug!("Recorded login of user {}", id),
                Ok(false) => debug!("User {} vanished before login was recorded", id),
                Err(e) => warn!("Failed to record login of user {}: {}", id, e),
            }
        });
    }

    /// Wait for login records still in flight
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending_logins.lock());
        while pending.join_next().await.is_some() {}
    }

    pub async fn list_users(&self) -> Result<Vec<User>, AuthError> {
        self.repo.list().await
    }

    pub async fn has_users(&self) -> Result<bool, AuthError> {
        self.repo.has_users().await
    }
}
