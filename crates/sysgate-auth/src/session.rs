//! Session registry
//!
//! Sessions are grouped per user behind one mutex each, so eviction-then-insert
//! for a user is a single critical section while different users never contend.
//! No `.await` happens while a user's mutex is held: a caller that is cancelled
//! has either fully registered its session or not touched the registry at all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::AuthError;

/// Random bytes in a session id
const SESSION_ID_BYTES: usize = 32;

/// A time-bounded, revocable proof of a successful login
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}

/// Per-user session state
#[derive(Debug, Default)]
struct UserSessions {
    /// Active and not-yet-swept revoked records
    sessions: HashMap<String, SessionRecord>,
    /// Bumped whenever every session of the user is invalidated
    epoch: u64,
    /// Set while the account is disabled
    blocked: bool,
}

impl UserSessions {
    fn revoke_active(&mut self, now: DateTime<Utc>) -> usize {
        let mut revoked = 0;
        for record in self.sessions.values_mut() {
            if record.is_active_at(now) {
                revoked += 1;
            }
            record.revoked = true;
        }
        revoked
    }
}

/// Tracks every session of every user
pub struct SessionRegistry {
    users: DashMap<i64, Arc<Mutex<UserSessions>>>,
    index: DashMap<String, i64>,
    epochs: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: DashMap::new(),
            index: DashMap::new(),
            epochs: AtomicU64::new(0),
            clock,
        }
    }

    /// Issue a session, applying the user's login policy
    ///
    /// With `allow_multi_login == false` every other active session of the user
    /// is revoked in the same critical section that inserts the new one.
    pub fn issue(
        &self,
        user_id: i64,
        allow_multi_login: bool,
        ttl: Duration,
    ) -> Result<SessionRecord, AuthError> {
        self.issue_inner(user_id, allow_multi_login, ttl, None)
    }

    /// Like [`SessionRegistry::issue`], but refuses if the user's sessions were
    /// invalidated wholesale since `epoch` was observed
    ///
    /// Closes the window between verifying a password and registering the
    /// session, during which a password change or disable may land.
    pub fn issue_at_epoch(
        &self,
        user_id: i64,
        allow_multi_login: bool,
        ttl: Duration,
        epoch: u64,
    ) -> Result<SessionRecord, AuthError> {
        self.issue_inner(user_id, allow_multi_login, ttl, Some(epoch))
    }

    fn issue_inner(
        &self,
        user_id: i64,
        allow_multi_login: bool,
        ttl: Duration,
        expected_epoch: Option<u64>,
    ) -> Result<SessionRecord, AuthError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| AuthError::MalformedInput("Session TTL out of range".to_string()))?;
        let session_id = generate_session_id();

        let slot = self.slot(user_id);
        let mut sessions = slot.lock();

        if sessions.blocked {
            return Err(AuthError::AccountDisabled);
        }
        if let Some(epoch) = expected_epoch
            && sessions.epoch != epoch
        {
            debug!("Credentials of user {} changed during login", user_id);
            return Err(AuthError::InvalidCredentials);
        }

        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        if !allow_multi_login {
            let evicted = sessions.revoke_active(now);
            if evicted > 0 {
                info!(
                    "Single-login policy evicted {} session(s) of user {}",
                    evicted, user_id
                );
                counter!("sysgate_sessions_evicted_total", "reason" => "single_login")
                    .increment(evicted as u64);
            }
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id,
            issued_at: now,
            expires_at,
            revoked: false,
        };
        sessions.sessions.insert(session_id.clone(), record.clone());
        self.index.insert(session_id, user_id);

        counter!("sysgate_sessions_issued_total").increment(1);
        Ok(record)
    }

    /// Check that a session exists, is not revoked and has not expired
    ///
    /// Never extends the session. An expired session is revoked on the spot.
    pub fn validate(&self, session_id: &str) -> Result<SessionRecord, AuthError> {
        let slot = self.slot_for_session(session_id).ok_or(AuthError::SessionInvalid)?;
        let mut sessions = slot.lock();
        let now = self.clock.now();

        let record = sessions
            .sessions
            .get_mut(session_id)
            .ok_or(AuthError::SessionInvalid)?;

        if record.revoked {
            return Err(AuthError::SessionInvalid);
        }
        if record.is_expired_at(now) {
            debug!("Session of user {} expired", record.user_id);
            record.revoked = true;
            return Err(AuthError::SessionInvalid);
        }

        Ok(record.clone())
    }

    /// Look up a session without judging it
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let slot = self.slot_for_session(session_id)?;
        let sessions = slot.lock();
        sessions.sessions.get(session_id).cloned()
    }

    /// Revoke a single session
    ///
    /// Revoking an already revoked session succeeds; an unknown id is `NotFound`.
    pub fn revoke(&self, session_id: &str) -> Result<(), AuthError> {
        let slot = self
            .slot_for_session(session_id)
            .ok_or_else(|| AuthError::NotFound("session".to_string()))?;
        let mut sessions = slot.lock();

        let record = sessions
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AuthError::NotFound("session".to_string()))?;

        if !record.revoked {
            record.revoked = true;
            debug!("Revoked a session of user {}", record.user_id);
            counter!("sysgate_sessions_evicted_total", "reason" => "logout").increment(1);
        }
        Ok(())
    }

    /// Revoke every session of a user, returning how many were active
    pub fn revoke_all_for_user(&self, user_id: i64) -> usize {
        let slot = self.slot(user_id);
        let mut sessions = slot.lock();
        sessions.epoch = self.next_epoch();
        let revoked = sessions.revoke_active(self.clock.now());

        if revoked > 0 {
            info!("Revoked {} session(s) of user {}", revoked, user_id);
            counter!("sysgate_sessions_evicted_total", "reason" => "revoke_all")
                .increment(revoked as u64);
        }
        revoked
    }

    /// Revoke every session of a user and refuse new ones until unblocked
    pub fn block_user(&self, user_id: i64) -> usize {
        let slot = self.slot(user_id);
        let mut sessions = slot.lock();
        sessions.blocked = true;
        sessions.epoch = self.next_epoch();
        let revoked = sessions.revoke_active(self.clock.now());

        info!(
            "Blocked user {}, revoked {} session(s)",
            user_id, revoked
        );
        if revoked > 0 {
            counter!("sysgate_sessions_evicted_total", "reason" => "disabled")
                .increment(revoked as u64);
        }
        revoked
    }

    /// Allow new sessions for a previously blocked user
    pub fn unblock_user(&self, user_id: i64) {
        if let Some(slot) = self.existing_slot(user_id) {
            slot.lock().blocked = false;
            debug!("Unblocked user {}", user_id);
        }
    }

    /// Current invalidation epoch of a user
    pub fn epoch(&self, user_id: i64) -> u64 {
        self.existing_slot(user_id)
            .map(|slot| slot.lock().epoch)
            .unwrap_or(0)
    }

    /// Extend an active session so it expires `ttl` from now
    pub fn renew(&self, session_id: &str, ttl: Duration) -> Result<SessionRecord, AuthError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| AuthError::MalformedInput("Session TTL out of range".to_string()))?;
        let slot = self.slot_for_session(session_id).ok_or(AuthError::SessionInvalid)?;
        let mut sessions = slot.lock();
        let now = self.clock.now();

        let record = sessions
            .sessions
            .get_mut(session_id)
            .ok_or(AuthError::SessionInvalid)?;
        if !record.is_active_at(now) {
            record.revoked = true;
            return Err(AuthError::SessionInvalid);
        }

        record.expires_at = expiry_after(now, ttl)?;
        debug!("Renewed a session of user {}", record.user_id);
        Ok(record.clone())
    }

    /// Active sessions of one user, oldest first
    pub fn sessions_for_user(&self, user_id: i64) -> Vec<SessionRecord> {
        let Some(slot) = self.existing_slot(user_id) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let sessions = slot.lock();
        let mut active: Vec<SessionRecord> = sessions
            .sessions
            .values()
            .filter(|r| r.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by_key(|r| r.issued_at);
        active
    }

    /// Number of active sessions across all users
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.snapshot_slots()
            .into_iter()
            .map(|(_, slot)| {
                slot.lock()
                    .sessions
                    .values()
                    .filter(|r| r.is_active_at(now))
                    .count()
            })
            .sum()
    }

    /// Drop expired and revoked records
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for (user_id, slot) in self.snapshot_slots() {
            let mut sessions = slot.lock();
            let before = sessions.sessions.len();
            let index = &self.index;
            sessions.sessions.retain(|id, record| {
                let keep = record.is_active_at(now);
                if !keep {
                    index.remove(id);
                }
                keep
            });
            let dropped = before - sessions.sessions.len();
            if dropped > 0 {
                debug!("Swept {} session(s) of user {}", dropped, user_id);
            }
            removed += dropped;
        }

        // A slot still remembering an epoch or a block must survive, or an
        // in-flight login could issue into a fresh slot unnoticed.
        self.users.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Some(s) => !(s.sessions.is_empty() && s.epoch == 0 && !s.blocked),
                None => true,
            }
        });

        removed
    }

    fn slot(&self, user_id: i64) -> Arc<Mutex<UserSessions>> {
        self.users.entry(user_id).or_default().value().clone()
    }

    fn existing_slot(&self, user_id: i64) -> Option<Arc<Mutex<UserSessions>>> {
        self.users.get(&user_id).map(|slot| slot.value().clone())
    }

    fn slot_for_session(&self, session_id: &str) -> Option<Arc<Mutex<UserSessions>>> {
        let user_id = *self.index.get(session_id)?.value();
        self.existing_slot(user_id)
    }

    fn snapshot_slots(&self) -> Vec<(i64, Arc<Mutex<UserSessions>>)> {
        self.users
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>, AuthError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| AuthError::MalformedInput("Session TTL out of range".to_string()))
}

/// Generate an unguessable session id
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Spawn a background task that sweeps the registry periodically
pub fn spawn_sweep_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Starting background session sweep task (interval: {:?})",
        interval
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = registry.sweep();
            if removed > 0 {
                info!("Scheduled sweep removed {} session(s)", removed);
            } else {
                debug!("Scheduled sweep found nothing to remove");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    const TTL: Duration = Duration::from_secs(3600);

    fn registry() -> (Arc<ManualClock>, SessionRegistry) {
        let clock = Arc::new(ManualClock::default());
        let registry = SessionRegistry::new(clock.clone());
        (clock, registry)
    }

    #[test]
    fn test_issue_then_validate() {
        let (clock, registry) = registry();
        let record = registry.issue(1, false, TTL).unwrap();

        assert_eq!(record.session_id.len(), SESSION_ID_BYTES * 2);
        assert_eq!(record.issued_at, clock.now());
        assert_eq!(record.expires_at, clock.now() + chrono::Duration::hours(1));
        assert!(!record.revoked);

        let validated = registry.validate(&record.session_id).unwrap();
        assert_eq!(validated, record);
    }

    #[test]
    fn test_unknown_session_invalid() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.validate("does-not-exist"),
            Err(AuthError::SessionInvalid)
        ));
    }

    #[test]
    fn test_single_login_evicts_previous() {
        let (_, registry) = registry();
        let a = registry.issue(1, false, TTL).unwrap();
        let b = registry.issue(1, false, TTL).unwrap();

        assert!(matches!(
            registry.validate(&a.session_id),
            Err(AuthError::SessionInvalid)
        ));
        assert!(registry.validate(&b.session_id).is_ok());
        assert!(registry.get(&a.session_id).unwrap().revoked);
    }

    #[test]
    fn test_multi_login_keeps_previous() {
        let (_, registry) = registry();
        let a = registry.issue(1, true, TTL).unwrap();
        let b = registry.issue(1, true, TTL).unwrap();

        assert!(registry.validate(&a.session_id).is_ok());
        assert!(registry.validate(&b.session_id).is_ok());
        assert_eq!(registry.sessions_for_user(1).len(), 2);
    }

    #[test]
    fn test_single_login_does_not_touch_other_users() {
        let (_, registry) = registry();
        let other = registry.issue(2, false, TTL).unwrap();
        registry.issue(1, false, TTL).unwrap();
        registry.issue(1, false, TTL).unwrap();

        assert!(registry.validate(&other.session_id).is_ok());
    }

    #[test]
    fn test_revoke_is_repeatable() {
        let (_, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();

        registry.revoke(&record.session_id).unwrap();
        registry.revoke(&record.session_id).unwrap();
        assert!(registry.validate(&record.session_id).is_err());

        assert!(matches!(
            registry.revoke("missing"),
            Err(AuthError::NotFound(_))
        ));
    }

    #[test]
    fn test_revoke_all_for_user() {
        let (_, registry) = registry();
        let a = registry.issue(1, true, TTL).unwrap();
        let b = registry.issue(1, true, TTL).unwrap();
        let other = registry.issue(2, true, TTL).unwrap();

        assert_eq!(registry.revoke_all_for_user(1), 2);
        assert!(registry.validate(&a.session_id).is_err());
        assert!(registry.validate(&b.session_id).is_err());
        assert!(registry.validate(&other.session_id).is_ok());

        assert_eq!(registry.revoke_all_for_user(1), 0);
        assert_eq!(registry.revoke_all_for_user(42), 0);
    }

    #[test]
    fn test_expiry() {
        let (clock, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();

        clock.advance(chrono::Duration::minutes(59));
        assert!(registry.validate(&record.session_id).is_ok());

        clock.advance(chrono::Duration::minutes(1));
        assert!(matches!(
            registry.validate(&record.session_id),
            Err(AuthError::SessionInvalid)
        ));
        // Lazily revoked
        assert!(registry.get(&record.session_id).unwrap().revoked);
    }

    #[test]
    fn test_validate_does_not_extend() {
        let (clock, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();

        for _ in 0..5 {
            clock.advance(chrono::Duration::minutes(10));
            let validated = registry.validate(&record.session_id).unwrap();
            assert_eq!(validated.expires_at, record.expires_at);
        }
    }

    #[test]
    fn test_renew() {
        let (clock, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();

        clock.advance(chrono::Duration::minutes(50));
        let renewed = registry.renew(&record.session_id, TTL).unwrap();
        assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::hours(1));

        clock.advance(chrono::Duration::minutes(30));
        assert!(registry.validate(&record.session_id).is_ok());

        registry.revoke(&record.session_id).unwrap();
        assert!(matches!(
            registry.renew(&record.session_id, TTL),
            Err(AuthError::SessionInvalid)
        ));
    }

    #[test]
    fn test_renew_refuses_expired() {
        let (clock, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();
        clock.advance(chrono::Duration::hours(2));

        assert!(registry.renew(&record.session_id, TTL).is_err());
        assert!(registry.validate(&record.session_id).is_err());
    }

    #[test]
    fn test_block_refuses_new_sessions() {
        let (_, registry) = registry();
        let record = registry.issue(1, true, TTL).unwrap();

        assert_eq!(registry.block_user(1), 1);
        assert!(registry.validate(&record.session_id).is_err());
        assert!(matches!(
            registry.issue(1, true, TTL),
            Err(AuthError::AccountDisabled)
        ));

        registry.unblock_user(1);
        assert!(registry.issue(1, true, TTL).is_ok());
    }

    #[test]
    fn test_epoch_guard() {
        let (_, registry) = registry();
        let observed = registry.epoch(1);
        assert_eq!(observed, 0);

        registry.revoke_all_for_user(1);
        assert!(registry.epoch(1) > observed);
        assert!(matches!(
            registry.issue_at_epoch(1, true, TTL, observed),
            Err(AuthError::InvalidCredentials)
        ));

        let current = registry.epoch(1);
        assert!(registry.issue_at_epoch(1, true, TTL, current).is_ok());
    }

    #[test]
    fn test_oversized_ttl_is_rejected() {
        let (_, registry) = registry();
        let huge = Duration::from_secs(10_000_000_000_000);

        assert!(matches!(
            registry.issue(1, false, huge),
            Err(AuthError::MalformedInput(_))
        ));
        assert!(registry.sessions_for_user(1).is_empty());

        let record = registry.issue(1, false, TTL).unwrap();
        assert!(matches!(
            registry.renew(&record.session_id, huge),
            Err(AuthError::MalformedInput(_))
        ));
        let unchanged = registry.validate(&record.session_id).unwrap();
        assert_eq!(unchanged.expires_at, record.expires_at);
    }

    #[test]
    fn test_sweep() {
        let (clock, registry) = registry();
        let expired = registry.issue(1, true, Duration::from_secs(60)).unwrap();
        let revoked = registry.issue(1, true, TTL).unwrap();
        let alive = registry.issue(2, true, TTL).unwrap();
        registry.revoke(&revoked.session_id).unwrap();

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(registry.sweep(), 2);

        assert!(registry.get(&expired.session_id).is_none());
        assert!(registry.get(&revoked.session_id).is_none());
        assert!(registry.validate(&alive.session_id).is_ok());
        assert_eq!(registry.active_count(), 1);

        // Swept sessions are unknown from then on
        assert!(matches!(
            registry.revoke(&revoked.session_id),
            Err(AuthError::NotFound(_))
        ));
    }

    #[test]
    fn test_sweep_keeps_blocked_slots() {
        let (_, registry) = registry();
        registry.issue(1, true, TTL).unwrap();
        registry.block_user(1);
        registry.sweep();

        assert!(matches!(
            registry.issue(1, true, TTL),
            Err(AuthError::AccountDisabled)
        ));
    }

    #[test]
    fn test_concurrent_single_login_leaves_one_session() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.issue(7, false, TTL).unwrap())
            })
            .collect();

        let issued: Vec<SessionRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let valid = issued
            .iter()
            .filter(|r| registry.validate(&r.session_id).is_ok())
            .count();

        assert_eq!(valid, 1);
        assert_eq!(registry.sessions_for_user(7).len(), 1);
    }

    #[test]
    fn test_block_races_with_validate() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let sessions: Vec<SessionRecord> = (0..8)
            .map(|_| registry.issue(3, true, TTL).unwrap())
            .collect();

        let validators: Vec<_> = sessions
            .iter()
            .map(|r| {
                let registry = registry.clone();
                let id = r.session_id.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _ = registry.validate(&id);
                    }
                })
            })
            .collect();

        registry.block_user(3);
        for v in validators {
            v.join().unwrap();
        }

        for record in &sessions {
            assert!(registry.validate(&record.session_id).is_err());
        }
    }

    #[tokio::test]
    async fn test_sweep_task_runs() {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(SessionRegistry::new(clock.clone()));
        let record = registry.issue(1, true, Duration::from_secs(1)).unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let handle = spawn_sweep_task(registry.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert!(registry.get(&record.session_id).is_none());
    }
}
