//! Signed session handles
//!
//! A handle is an HS256 JWT wrapping the session id. The signature only makes
//! the handle tamper-evident; whether the session is still good is always
//! decided by the [`SessionRegistry`](crate::session::SessionRegistry).

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;
use crate::session::SessionRecord;

/// Handle claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user external id)
    pub sub: String,
    /// Session id
    pub sid: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// Signs and opens session handles
#[derive(Clone)]
pub struct SessionSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionSigner {
    /// Create a new signer
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is judged by the registry, which may have renewed the session
        validation.validate_exp = false;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Wrap a session into a signed handle
    pub fn sign(&self, session: &SessionRecord, user_uuid: &Uuid) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_uuid.to_string(),
            sid: session.session_id.clone(),
            exp: session.expires_at.timestamp(),
            iat: session.issued_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to sign session handle: {}", e)))
    }

    /// Check the signature of a handle and return its claims
    pub fn open(&self, handle: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(handle, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Rejected session handle: {}", e);
                AuthError::SessionInvalid
            })
    }
}
