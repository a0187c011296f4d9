//! Password hashing and verification
//!
//! Hashes are Argon2id over the plaintext with the per-user salt as the Argon2
//! salt input and an optional deployment pepper as the Argon2 secret key. The
//! stored value is the hex encoding of the 32-byte raw output; the salt lives
//! only in its own column.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::HashConfig;
use crate::error::AuthError;

/// Raw Argon2 output length in bytes
pub const HASH_OUTPUT_LEN: usize = 32;

/// Argon2 refuses salts longer than this
const MAX_SALT_LEN: usize = 64;

/// Salt used to burn a derivation when there is no user to check against
const DUMMY_SALT: [u8; MAX_SALT_LEN] = [0x5a; MAX_SALT_LEN];

/// Derives and verifies salted password hashes
///
/// Cloning is cheap; clones share the same bounded worker budget.
#[derive(Clone)]
pub struct HashCodec {
    params: Params,
    pepper: Option<Arc<[u8]>>,
    max_password_len: usize,
    min_salt_len: usize,
    salt_len: usize,
    permits: Arc<Semaphore>,
}

impl HashCodec {
    /// Create a codec from configuration
    pub fn new(config: &HashConfig) -> Result<Self, AuthError> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            Some(HASH_OUTPUT_LEN),
        )
        .map_err(|e| AuthError::MalformedInput(format!("Invalid hashing parameters: {}", e)))?;

        if config.min_salt_len == 0 || config.min_salt_len > MAX_SALT_LEN {
            return Err(AuthError::MalformedInput(format!(
                "min_salt_len must be between 1 and {}",
                MAX_SALT_LEN
            )));
        }
        if config.salt_len < config.min_salt_len || config.salt_len > MAX_SALT_LEN {
            return Err(AuthError::MalformedInput(format!(
                "salt_len must be between min_salt_len ({}) and {}",
                config.min_salt_len, MAX_SALT_LEN
            )));
        }

        let pepper = match config.pepper.as_deref() {
            Some("") | None => None,
            Some(p) => Some(Arc::from(p.as_bytes())),
        };

        debug!(
            "Hash codec: argon2id m={}KiB t={} p={}, {} workers, pepper {}",
            config.memory_kib,
            config.iterations,
            config.parallelism,
            config.workers.max(1),
            if pepper.is_some() { "set" } else { "unset" }
        );

        Ok(Self {
            params,
            pepper,
            max_password_len: config.max_password_len,
            min_salt_len: config.min_salt_len,
            salt_len: config.salt_len,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
        })
    }

    /// Generate a fresh random salt from the OS CSPRNG
    pub fn generate_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.salt_len];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    pub fn max_password_len(&self) -> usize {
        self.max_password_len
    }

    /// Reject inputs before any expensive work happens
    pub fn check_inputs(&self, plaintext: &str, salt: &[u8]) -> Result<(), AuthError> {
        if plaintext.is_empty() {
            return Err(AuthError::MalformedInput("Password is empty".to_string()));
        }
        if plaintext.len() > self.max_password_len {
            return Err(AuthError::MalformedInput(format!(
                "Password exceeds maximum length of {} bytes",
                self.max_password_len
            )));
        }
        if salt.len() < self.min_salt_len {
            return Err(AuthError::MalformedInput(format!(
                "Salt shorter than {} bytes",
                self.min_salt_len
            )));
        }
        if salt.len() > MAX_SALT_LEN {
            return Err(AuthError::MalformedInput(format!(
                "Salt longer than {} bytes",
                MAX_SALT_LEN
            )));
        }
        Ok(())
    }

    /// Derive the encoded hash for a plaintext and salt
    pub fn derive(&self, plaintext: &str, salt: &[u8]) -> Result<String, AuthError> {
        self.check_inputs(plaintext, salt)?;

        let mut out = Zeroizing::new([0u8; HASH_OUTPUT_LEN]);
        self.hasher()?
            .hash_password_into(plaintext.as_bytes(), salt, &mut out[..])
            .map_err(|e| AuthError::MalformedInput(format!("Password hashing failed: {}", e)))?;

        Ok(hex::encode(&out[..]))
    }

    /// Recompute the hash and compare it against `expected` in constant time
    pub fn verify(&self, plaintext: &str, salt: &[u8], expected: &str) -> Result<bool, AuthError> {
        let actual = Zeroizing::new(self.derive(plaintext, salt)?);
        Ok(constant_time_eq(actual.as_bytes(), expected.as_bytes()))
    }

    /// Spend the same work as a real verification and discard the result
    ///
    /// Used when there is no stored hash to check, so that path costs as much
    /// as a wrong password.
    pub fn burn(&self, plaintext: &str) {
        let salt = &DUMMY_SALT[..self.salt_len];
        if let Err(e) = self.derive(plaintext, salt) {
            warn!("Dummy derivation failed: {}", e);
        }
    }

    /// [`HashCodec::derive`] on the bounded blocking pool
    pub async fn derive_async(&self, plaintext: &str, salt: &[u8]) -> Result<String, AuthError> {
        self.check_inputs(plaintext, salt)?;
        let plaintext = Zeroizing::new(plaintext.to_string());
        let salt = salt.to_vec();
        self.run_blocking(move |codec| codec.derive(&plaintext, &salt))
            .await?
    }

    /// [`HashCodec::verify`] on the bounded blocking pool
    pub async fn verify_async(
        &self,
        plaintext: &str,
        salt: &[u8],
        expected: &str,
    ) -> Result<bool, AuthError> {
        self.check_inputs(plaintext, salt)?;
        let plaintext = Zeroizing::new(plaintext.to_string());
        let salt = salt.to_vec();
        let expected = expected.to_string();
        self.run_blocking(move |codec| codec.verify(&plaintext, &salt, &expected))
            .await?
    }

    /// [`HashCodec::burn`] on the bounded blocking pool
    pub async fn burn_async(&self, plaintext: &str) -> Result<(), AuthError> {
        let plaintext = Zeroizing::new(plaintext.to_string());
        self.run_blocking(move |codec| codec.burn(&plaintext)).await
    }

    /// Run CPU-heavy hashing off the async workers, at most `workers` at a time
    ///
    /// The permit travels into the blocking closure, so a caller that gives up
    /// early does not free a slot while the derivation is still running.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&HashCodec) -> T + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AuthError::Internal(format!("Hash worker pool closed: {}", e)))?;
        let codec = self.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&codec)
        })
        .await
        .map_err(|e| AuthError::Internal(format!("Hash worker failed: {}", e)))
    }

    fn hasher(&self) -> Result<Argon2<'_>, AuthError> {
        match &self.pepper {
            Some(pepper) => Argon2::new_with_secret(
                pepper,
                Algorithm::Argon2id,
                Version::V0x13,
                self.params.clone(),
            )
            .map_err(|e| AuthError::MalformedInput(format!("Invalid pepper: {}", e))),
            None => Ok(Argon2::new(
                Algorithm::Argon2id,
                Version::V0x13,
                self.params.clone(),
            )),
        }
    }
}

/// Constant-time byte comparison to prevent timing attacks
///
/// Only the length may short-circuit; encoded hashes all share one length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
pub(crate) fn test_config() -> HashConfig {
    HashConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
        workers: 2,
        ..Default::default()
    }
}
