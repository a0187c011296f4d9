//! Login orchestration
//!
//! The [`Authenticator`] ties the hash codec, credential store, session
//! registry and handle signer together. Failure paths that could reveal
//! whether a username exists all cost one full derivation.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use sysgate_db::{NewUser, User, UserRecord};
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::password::HashCodec;
use crate::session::{SessionRecord, SessionRegistry};
use crate::store::CredentialStore;
use crate::token::SessionSigner;

/// Row id SQLite never assigns, used for the decoy lookup of unknown users
const NO_SUCH_USER_ID: i64 = 0;

/// A registered session together with its signed handle
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub record: SessionRecord,
    pub handle: String,
}

/// Request to create a user with a plaintext password
#[derive(Clone, Default)]
pub struct CreateUser {
    pub username: String,
    pub nickname: Option<String>,
    pub password: String,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub is_multi_login: bool,
}

impl std::fmt::Debug for CreateUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateUser")
            .field("username", &self.username)
            .field("nickname", &self.nickname)
            .field("password", &"[redacted]")
            .field("is_superuser", &self.is_superuser)
            .field("is_staff", &self.is_staff)
            .field("is_multi_login", &self.is_multi_login)
            .finish()
    }
}

/// Verifies credentials and hands out sessions
#[derive(Clone)]
pub struct Authenticator {
    store: CredentialStore,
    codec: HashCodec,
    sessions: Arc<SessionRegistry>,
    signer: SessionSigner,
    session_ttl: Duration,
}

impl Authenticator {
    pub fn new(
        store: CredentialStore,
        codec: HashCodec,
        signer: SessionSigner,
        session_ttl: Duration,
    ) -> Self {
        let sessions = store.sessions().clone();
        Self {
            store,
            codec,
            sessions,
            signer,
            session_ttl,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn signer(&self) -> &SessionSigner {
        &self.signer
    }

    /// Log a user in
    ///
    /// Unknown usernames and wrong passwords both yield
    /// [`AuthError::InvalidCredentials`]. A disabled account is reported as
    /// such, but only after the password has been checked.
    pub async fn login(&self, username: &str, plaintext: &str) -> Result<IssuedSession, AuthError> {
        let result = self.try_login(username, plaintext).await;
        counter!("sysgate_login_total", "outcome" => login_outcome(&result)).increment(1);
        match &result {
            Ok(issued) => info!(
                "User {} logged in (user id {})",
                username, issued.record.user_id
            ),
            Err(e) if e.is_storage_failure() => warn!("Login of {} aborted: {}", username, e),
            Err(e) => debug!("Login of {} refused: {}", username, e),
        }
        result
    }

    async fn try_login(&self, username: &str, plaintext: &str) -> Result<IssuedSession, AuthError> {
        self.check_plaintext(plaintext)?;

        let Some(id) = self.find_id(username, plaintext).await? else {
            return Err(AuthError::InvalidCredentials);
        };

        // Anything that invalidates the user's sessions from here on bumps the
        // epoch, and the issue below is refused.
        let epoch = self.sessions.epoch(id);
        let record = match self.store.lookup_by_id(id).await {
            Ok(record) => record,
            Err(AuthError::NotFound(_)) => {
                self.codec.burn_async(plaintext).await?;
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        let matches = self.check_password(&record, plaintext).await?;
        if !record.user.status.is_active() {
            return Err(AuthError::AccountDisabled);
        }
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }

        let user = record.user;
        let session =
            self.sessions
                .issue_at_epoch(user.id, user.is_multi_login, self.session_ttl, epoch)?;
        self.store.record_login(user.id, session.issued_at);
        self.seal(session, &user)
    }

    /// Resolve a username to an id
    ///
    /// An unknown username pays for the same two lookups and one derivation
    /// as a known one.
    async fn find_id(&self, username: &str, plaintext: &str) -> Result<Option<i64>, AuthError> {
        match self.store.lookup_by_username(username).await {
            Ok(record) => Ok(Some(record.user.id)),
            Err(AuthError::NotFound(_)) => {
                match self.store.lookup_by_id(NO_SUCH_USER_ID).await {
                    Ok(_) | Err(AuthError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.codec.burn_async(plaintext).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_password(&self, record: &UserRecord, plaintext: &str) -> Result<bool, AuthError> {
        self.codec
            .verify_async(plaintext, &record.salt, &record.password_hash)
            .await
    }

    fn check_plaintext(&self, plaintext: &str) -> Result<(), AuthError> {
        if plaintext.is_empty() {
            return Err(AuthError::MalformedInput("Password is empty".to_string()));
        }
        if plaintext.len() > self.codec.max_password_len() {
            return Err(AuthError::MalformedInput(format!(
                "Password exceeds {} bytes",
                self.codec.max_password_len()
            )));
        }
        Ok(())
    }

    /// Sign a freshly registered session, withdrawing it if signing fails
    fn seal(&self, session: SessionRecord, user: &User) -> Result<IssuedSession, AuthError> {
        match self.signer.sign(&session, &user.uuid) {
            Ok(handle) => Ok(IssuedSession {
                record: session,
                handle,
            }),
            Err(e) => {
                if let Err(revoke_err) = self.sessions.revoke(&session.session_id) {
                    warn!("Failed to withdraw unsigned session: {}", revoke_err);
                }
                Err(e)
            }
        }
    }

    /// End a session; unknown and already revoked sessions are fine
    pub fn logout(&self, session_id: &str) -> Result<(), AuthError> {
        match self.sessions.revoke(session_id) {
            Ok(()) | Err(AuthError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// [`Authenticator::logout`] for a signed handle
    pub fn logout_handle(&self, handle: &str) -> Result<(), AuthError> {
        match self.signer.open(handle) {
            Ok(claims) => self.logout(&claims.sid),
            Err(AuthError::SessionInvalid) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Change a password after re-checking the current one
    ///
    /// Every session of the user is revoked once the new password is stored.
    pub async fn change_password(
        &self,
        user_id: i64,
        old_plaintext: &str,
        new_plaintext: &str,
    ) -> Result<(), AuthError> {
        self.check_plaintext(old_plaintext)?;
        self.check_plaintext(new_plaintext)?;

        let record = match self.store.lookup_by_id(user_id).await {
            Ok(record) => record,
            Err(AuthError::NotFound(_)) => {
                self.codec.burn_async(old_plaintext).await?;
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        let matches = self.check_password(&record, old_plaintext).await?;
        if !record.user.status.is_active() {
            return Err(AuthError::AccountDisabled);
        }
        if !matches {
            debug!("Password change for user {} refused", user_id);
            return Err(AuthError::InvalidCredentials);
        }

        self.store_new_password(user_id, new_plaintext).await?;
        counter!("sysgate_password_changes_total", "kind" => "change").increment(1);
        Ok(())
    }

    /// Set a new password without knowing the old one
    pub async fn reset_password(&self, user_id: i64, new_plaintext: &str) -> Result<(), AuthError> {
        self.check_plaintext(new_plaintext)?;
        self.store.lookup_by_id(user_id).await?;

        self.store_new_password(user_id, new_plaintext).await?;
        counter!("sysgate_password_changes_total", "kind" => "reset").increment(1);
        Ok(())
    }

    async fn store_new_password(&self, user_id: i64, plaintext: &str) -> Result<(), AuthError> {
        let salt = self.codec.generate_salt();
        let hash = self.codec.derive_async(plaintext, &salt).await?;
        self.store.update_password(user_id, &hash, &salt).await
    }

    /// Create a user with a fresh salt
    pub async fn create_user(&self, request: CreateUser) -> Result<User, AuthError> {
        let username = request.username.trim();
        if username.is_empty() {
            return Err(AuthError::MalformedInput("Username is empty".to_string()));
        }
        self.check_plaintext(&request.password)?;

        let salt = self.codec.generate_salt();
        let password_hash = self.codec.derive_async(&request.password, &salt).await?;

        self.store
            .insert_user(NewUser {
                username: username.to_string(),
                nickname: request.nickname,
                password_hash,
                salt,
                is_superuser: request.is_superuser,
                is_staff: request.is_staff,
                is_multi_login: request.is_multi_login,
            })
            .await
    }

    /// Extend the session behind a handle and return a new handle
    pub async fn refresh(&self, handle: &str) -> Result<IssuedSession, AuthError> {
        let claims = self.signer.open(handle)?;
        let current = self.sessions.validate(&claims.sid)?;
        let user = self.active_user(&current).await?;
        if user.uuid.to_string() != claims.sub {
            return Err(AuthError::SessionInvalid);
        }

        let renewed = self.sessions.renew(&claims.sid, self.session_ttl)?;
        debug!("Refreshed a session of user {}", user.username);
        let handle = self.signer.sign(&renewed, &user.uuid)?;
        Ok(IssuedSession {
            record: renewed,
            handle,
        })
    }

    /// The user behind a live session
    pub async fn current_user(&self, session_id: &str) -> Result<User, AuthError> {
        let session = self.sessions.validate(session_id)?;
        self.active_user(&session).await
    }

    /// [`Authenticator::current_user`] for a signed handle
    pub async fn current_user_by_handle(&self, handle: &str) -> Result<User, AuthError> {
        let claims = self.signer.open(handle)?;
        let user = self.current_user(&claims.sid).await?;
        if user.uuid.to_string() != claims.sub {
            return Err(AuthError::SessionInvalid);
        }
        Ok(user)
    }

    async fn active_user(&self, session: &SessionRecord) -> Result<User, AuthError> {
        let user = match self.store.lookup_by_id(session.user_id).await {
            Ok(record) => record.user,
            Err(AuthError::NotFound(_)) => return Err(AuthError::SessionInvalid),
            Err(e) => return Err(e),
        };
        if !user.status.is_active() {
            return Err(AuthError::AccountDisabled);
        }
        Ok(user)
    }
}

fn login_outcome(result: &Result<IssuedSession, AuthError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(AuthError::InvalidCredentials) => "invalid_credentials",
        Err(AuthError::AccountDisabled) => "disabled",
        Err(AuthError::MalformedInput(_)) => "malformed",
        Err(AuthError::StorageUnavailable(_)) => "storage_unavailable",
        Err(_) => "error",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::password::test_config;
    use crate::store::UserRepository;
    use crate::store::tests::UnavailableRepository;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sysgate_db::{Database, UpdateUserFlags, UserStatus};

    /// Database that counts the lookups a login performs
    struct CountingRepository {
        inner: Database,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl UserRepository for CountingRepository {
        async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, AuthError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_username(username).await
        }
        async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, AuthError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_id(id).await
        }
        async fn insert(&self, user: NewUser) -> Result<User, AuthError> {
            self.inner.insert(user).await
        }
        async fn update_password(&self, id: i64, hash: &str, salt: &[u8]) -> Result<bool, AuthError> {
            self.inner.update_password(id, hash, salt).await
        }
        async fn update_status(&self, id: i64, status: UserStatus) -> Result<bool, AuthError> {
            self.inner.update_status(id, status).await
        }
        async fn update_flags(&self, id: i64, flags: UpdateUserFlags) -> Result<bool, AuthError> {
            self.inner.update_flags(id, flags).await
        }
        async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<bool, AuthError> {
            UserRepository::update_last_login(&self.inner, id, at).await
        }
        async fn list(&self) -> Result<Vec<User>, AuthError> {
            self.inner.list().await
        }
        async fn has_users(&self) -> Result<bool, AuthError> {
            UserRepository::has_users(&self.inner).await
        }
    }

    pub(crate) struct Harness {
        pub auth: Authenticator,
        pub clock: Arc<ManualClock>,
        pub db: Database,
    }

    pub(crate) async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let sessions = Arc::new(SessionRegistry::new(clock.clone()));
        let store = CredentialStore::new(Arc::new(db.clone()), sessions);
        let codec = HashCodec::new(&test_config()).unwrap();
        let auth = Authenticator::new(
            store,
            codec,
            SessionSigner::new("test-secret"),
            Duration::from_secs(3600),
        );
        Harness { auth, clock, db }
    }

    pub(crate) fn request(username: &str, password: &str) -> CreateUser {
        CreateUser {
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_login_success() {
        let h = harness().await;
        let user = h.auth.create_user(request("admin", "correct-pw")).await.unwrap();

        let issued = h.auth.login("admin", "correct-pw").await.unwrap();
        assert_eq!(issued.record.user_id, user.id);
        assert!(h.auth.sessions().validate(&issued.record.session_id).is_ok());

        let claims = h.auth.signer().open(&issued.handle).unwrap();
        assert_eq!(claims.sid, issued.record.session_id);
        assert_eq!(claims.sub, user.uuid.to_string());
    }

    #[tokio::test]
    async fn test_wrong_password_matches_unknown_user() {
        let h = harness().await;
        h.auth.create_user(request("admin", "correct-pw")).await.unwrap();

        let wrong = h.auth.login("admin", "wrong-pw").await.unwrap_err();
        let unknown = h.auth.login("ghost", "correct-pw").await.unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn test_unknown_user_costs_the_same_lookups() {
        let repo = Arc::new(CountingRepository {
            inner: Database::in_memory().await.unwrap(),
            lookups: AtomicUsize::new(0),
        });
        let sessions = Arc::new(SessionRegistry::new(Arc::new(ManualClock::default())));
        let auth = Authenticator::new(
            CredentialStore::new(repo.clone(), sessions),
            HashCodec::new(&test_config()).unwrap(),
            SessionSigner::new("test-secret"),
            Duration::from_secs(3600),
        );
        auth.create_user(request("admin", "correct-pw")).await.unwrap();

        repo.lookups.store(0, Ordering::SeqCst);
        auth.login("admin", "wrong-pw").await.unwrap_err();
        let known = repo.lookups.swap(0, Ordering::SeqCst);

        auth.login("ghost", "wrong-pw").await.unwrap_err();
        let unknown = repo.lookups.load(Ordering::SeqCst);

        assert_eq!(known, 2);
        assert_eq!(unknown, known);
    }

    #[tokio::test]
    async fn test_disabled_account() {
        let h = harness().await;
        let user = h.auth.create_user(request("test", "test-pw")).await.unwrap();
        h.auth
            .store()
            .set_status(user.id, UserStatus::Disabled)
            .await
            .unwrap();

        assert!(matches!(
            h.auth.login("test", "test-pw").await,
            Err(AuthError::AccountDisabled)
        ));

        h.auth
            .store()
            .set_status(user.id, UserStatus::Active)
            .await
            .unwrap();
        assert!(h.auth.login("test", "test-pw").await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_password() {
        let h = harness().await;
        h.auth.create_user(request("admin", "correct-pw")).await.unwrap();

        assert!(matches!(
            h.auth.login("admin", "").await,
            Err(AuthError::MalformedInput(_))
        ));
        let oversized = "x".repeat(test_config().max_password_len + 1);
        assert!(matches!(
            h.auth.login("admin", &oversized).await,
            Err(AuthError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let h = harness().await;
        h.auth.create_user(request("admin", "correct-pw")).await.unwrap();
        let issued = h.auth.login("admin", "correct-pw").await.unwrap();

        h.auth.logout(&issued.record.session_id).unwrap();
        h.auth.logout(&issued.record.session_id).unwrap();
        h.auth.logout("never-issued").unwrap();
        h.auth.logout_handle(&issued.handle).unwrap();
        h.auth.logout_handle("garbage").unwrap();

        assert!(h.auth.sessions().validate(&issued.record.session_id).is_err());
    }

    #[tokio::test]
    async fn test_change_password_round_trip() {
        let h = harness().await;
        let user = h.auth.create_user(request("admin", "old-pw")).await.unwrap();
        let before = h.auth.login("admin", "old-pw").await.unwrap();
        let old_salt = h.auth.store().lookup_by_id(user.id).await.unwrap().salt;

        h.auth.change_password(user.id, "old-pw", "new-pw").await.unwrap();

        assert!(h.auth.sessions().validate(&before.record.session_id).is_err());
        assert!(h.auth.login("admin", "new-pw").await.is_ok());
        assert!(matches!(
            h.auth.login("admin", "old-pw").await,
            Err(AuthError::InvalidCredentials)
        ));
        let new_salt = h.auth.store().lookup_by_id(user.id).await.unwrap().salt;
        assert_ne!(old_salt, new_salt);
    }

    #[tokio::test]
    async fn test_change_password_requires_old() {
        let h = harness().await;
        let user = h.auth.create_user(request("admin", "old-pw")).await.unwrap();

        assert!(matches!(
            h.auth.change_password(user.id, "not-it", "new-pw").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            h.auth.change_password(999, "old-pw", "new-pw").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            h.auth.change_password(user.id, "old-pw", "").await,
            Err(AuthError::MalformedInput(_))
        ));
        assert!(h.auth.login("admin", "old-pw").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_password() {
        let h = harness().await;
        let user = h.auth.create_user(request("test", "forgotten")).await.unwrap();
        let session = h.auth.login("test", "forgotten").await.unwrap();

        h.auth.reset_password(user.id, "replacement").await.unwrap();
        assert!(h.auth.sessions().validate(&session.record.session_id).is_err());
        assert!(h.auth.login("test", "replacement").await.is_ok());
        assert!(matches!(
            h.auth.reset_password(999, "replacement").await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_user_rejects_duplicates() {
        let h = harness().await;
        h.auth.create_user(request("admin", "pw-one")).await.unwrap();
        assert!(matches!(
            h.auth.create_user(request("admin", "pw-two")).await,
            Err(AuthError::Duplicate(_))
        ));
        assert!(matches!(
            h.auth.create_user(request("  ", "pw-two")).await,
            Err(AuthError::MalformedInput(_))
        ));
    }

    #[tokio::test]
    async fn test_single_login_policy_through_login() {
        let h = harness().await;
        h.auth
            .create_user(CreateUser {
                is_multi_login: false,
                ..request("test", "test-pw")
            })
            .await
            .unwrap();

        let a = h.auth.login("test", "test-pw").await.unwrap();
        let b = h.auth.login("test", "test-pw").await.unwrap();
        assert!(h.auth.sessions().validate(&a.record.session_id).is_err());
        assert!(h.auth.sessions().validate(&b.record.session_id).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_extends_session() {
        let h = harness().await;
        h.auth.create_user(request("admin", "correct-pw")).await.unwrap();
        let issued = h.auth.login("admin", "correct-pw").await.unwrap();

        h.clock.advance(chrono::Duration::minutes(50));
        let refreshed = h.auth.refresh(&issued.handle).await.unwrap();
        assert_eq!(refreshed.record.session_id, issued.record.session_id);
        assert!(refreshed.record.expires_at > issued.record.expires_at);

        h.clock.advance(chrono::Duration::minutes(30));
        assert!(h.auth.sessions().validate(&issued.record.session_id).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_after_expiry_fails() {
        let h = harness().await;
        h.auth.create_user(request("admin", "correct-pw")).await.unwrap();
        let issued = h.auth.login("admin", "correct-pw").await.unwrap();

        h.clock.advance(chrono::Duration::hours(2));
        assert!(matches!(
            h.auth.refresh(&issued.handle).await,
            Err(AuthError::SessionInvalid)
        ));
    }

    #[tokio::test]
    async fn test_current_user() {
        let h = harness().await;
        let user = h.auth.create_user(request("admin", "correct-pw")).await.unwrap();
        let issued = h.auth.login("admin", "correct-pw").await.unwrap();

        let current = h.auth.current_user(&issued.record.session_id).await.unwrap();
        assert_eq!(current.id, user.id);
        let by_handle = h.auth.current_user_by_handle(&issued.handle).await.unwrap();
        assert_eq!(by_handle.username, "admin");

        h.auth
            .store()
            .set_status(user.id, UserStatus::Disabled)
            .await
            .unwrap();
        assert!(h.auth.current_user(&issued.record.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_login_fails_closed_when_storage_down() {
        let clock = Arc::new(ManualClock::default());
        let sessions = Arc::new(SessionRegistry::new(clock));
        let store = CredentialStore::new(Arc::new(UnavailableRepository), sessions.clone());
        let auth = Authenticator::new(
            store,
            HashCodec::new(&test_config()).unwrap(),
            SessionSigner::new("test-secret"),
            Duration::from_secs(3600),
        );

        assert!(matches!(
            auth.login("admin", "correct-pw").await,
            Err(AuthError::StorageUnavailable(_))
        ));
        assert_eq!(sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_logins_with_password_change() {
        let h = harness().await;
        let user = h.auth.create_user(request("admin", "old-pw")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let auth = h.auth.clone();
            tasks.push(tokio::spawn(async move { auth.login("admin", "old-pw").await }));
        }
        h.auth.change_password(user.id, "old-pw", "new-pw").await.unwrap();
        for task in tasks {
            let _ = task.await.unwrap();
        }

        // Whatever raced, nothing logged in with the old password survives
        assert!(h.auth.sessions().sessions_for_user(user.id).is_empty());
        assert!(matches!(
            h.auth.login("admin", "old-pw").await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
