//! Capability checks on live sessions

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use sysgate_db::User;
use tracing::debug;

use crate::error::AuthError;
use crate::session::SessionRegistry;
use crate::store::CredentialStore;
use crate::token::SessionSigner;

/// Coarse capability a request requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Any active session on an active account
    None,
    /// Staff or superuser
    Staff,
    Superuser,
}

impl Capability {
    /// Whether `user` holds this capability
    pub fn is_satisfied_by(&self, user: &User) -> bool {
        match self {
            Capability::None => true,
            Capability::Staff => user.is_staff || user.is_superuser,
            Capability::Superuser => user.is_superuser,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::None => "none",
            Capability::Staff => "staff",
            Capability::Superuser => "superuser",
        }
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SessionInvalid,
    AccountDisabled,
    InsufficientCapability,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::SessionInvalid => "session_invalid",
            DenyReason::AccountDisabled => "account_disabled",
            DenyReason::InsufficientCapability => "insufficient_capability",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DenyReason> for AuthError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::SessionInvalid => AuthError::SessionInvalid,
            DenyReason::AccountDisabled => AuthError::AccountDisabled,
            DenyReason::InsufficientCapability => AuthError::InsufficientCapability,
        }
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone)]
pub enum Decision {
    Granted(User),
    Denied(DenyReason),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted(_))
    }

    /// Turn a denial into the matching error
    pub fn into_result(self) -> Result<User, AuthError> {
        match self {
            Decision::Granted(user) => Ok(user),
            Decision::Denied(reason) => Err(reason.into()),
        }
    }
}

/// Authorizes requests carrying a session
///
/// Account status is read from the credential store on every call.
#[derive(Clone)]
pub struct AccessGate {
    store: CredentialStore,
    sessions: Arc<SessionRegistry>,
    signer: SessionSigner,
}

impl AccessGate {
    pub fn new(store: CredentialStore, signer: SessionSigner) -> Self {
        let sessions = store.sessions().clone();
        Self {
            store,
            sessions,
            signer,
        }
    }

    /// Decide whether `session_id` may act with `required`
    ///
    /// A store failure is an error, never a grant.
    pub async fn authorize(
        &self,
        session_id: &str,
        required: Capability,
    ) -> Result<Decision, AuthError> {
        let decision = self.decide(session_id, required).await;
        let outcome = match &decision {
            Ok(Decision::Granted(_)) => "granted",
            Ok(Decision::Denied(reason)) => reason.as_str(),
            Err(_) => "error",
        };
        counter!("sysgate_authorize_total", "outcome" => outcome).increment(1);
        decision
    }

    async fn decide(&self, session_id: &str, required: Capability) -> Result<Decision, AuthError> {
        let session = match self.sessions.validate(session_id) {
            Ok(session) => session,
            Err(AuthError::SessionInvalid) => {
                return Ok(Decision::Denied(DenyReason::SessionInvalid));
            }
            Err(e) => return Err(e),
        };

        let user = match self.store.lookup_by_id(session.user_id).await {
            Ok(record) => record.user,
            Err(AuthError::NotFound(_)) => {
                debug!("Session outlived user {}", session.user_id);
                return Ok(Decision::Denied(DenyReason::SessionInvalid));
            }
            Err(e) => return Err(e),
        };

        if !user.status.is_active() {
            return Ok(Decision::Denied(DenyReason::AccountDisabled));
        }
        if !required.is_satisfied_by(&user) {
            debug!(
                "User {} lacks the {} capability",
                user.username,
                required.as_str()
            );
            return Ok(Decision::Denied(DenyReason::InsufficientCapability));
        }

        Ok(Decision::Granted(user))
    }

    /// [`AccessGate::authorize`] for a signed handle
    pub async fn authorize_handle(
        &self,
        handle: &str,
        required: Capability,
    ) -> Result<Decision, AuthError> {
        let claims = match self.signer.open(handle) {
            Ok(claims) => claims,
            Err(AuthError::SessionInvalid) => {
                return Ok(Decision::Denied(DenyReason::SessionInvalid));
            }
            Err(e) => return Err(e),
        };

        match self.authorize(&claims.sid, required).await? {
            Decision::Granted(user) if user.uuid.to_string() != claims.sub => {
                Ok(Decision::Denied(DenyReason::SessionInvalid))
            }
            decision => Ok(decision),
        }
    }
}
