//! Authentication configuration
//!
//! These types are deserialized from the `[auth]` and `[hashing]` sections of
//! the binary's TOML configuration and handed to the core components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AuthError;

/// Longest accepted session lifetime (one year)
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 3600;

/// Password hashing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Argon2 memory cost in KiB
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Argon2 iteration count
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Argon2 lanes
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Longest accepted plaintext, in bytes
    #[serde(default = "default_max_password_len")]
    pub max_password_len: usize,
    /// Shortest accepted salt, in bytes
    #[serde(default = "default_min_salt_len")]
    pub min_salt_len: usize,
    /// Length of freshly generated salts, in bytes
    #[serde(default = "default_salt_len")]
    pub salt_len: usize,
    /// Concurrent derivations allowed on the blocking pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Deployment-wide secret fed to Argon2 as its key
    #[serde(default, skip_serializing)]
    pub pepper: Option<String>,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
            max_password_len: default_max_password_len(),
            min_salt_len: default_min_salt_len(),
            salt_len: default_salt_len(),
            workers: default_workers(),
            pepper: None,
        }
    }
}

/// Session and token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for signed session handles
    #[serde(default = "default_token_secret", skip_serializing)]
    pub token_secret: String,
    /// Lifetime of a freshly issued session
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Interval between expired-session sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject settings the session layer cannot work with
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.token_secret.is_empty() {
            return Err(AuthError::MalformedInput("auth.token_secret is empty".to_string()));
        }
        if self.session_ttl_secs == 0 {
            return Err(AuthError::MalformedInput(
                "auth.session_ttl_secs must be positive".to_string(),
            ));
        }
        if self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(AuthError::MalformedInput(format!(
                "auth.session_ttl_secs must not exceed {}",
                MAX_SESSION_TTL_SECS
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(AuthError::MalformedInput(
                "auth.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: default_token_secret(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// Argon2id defaults recommended by OWASP (19 MiB, 2 passes, 1 lane)
fn default_memory_kib() -> u32 {
    19 * 1024
}

fn default_iterations() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

fn default_max_password_len() -> usize {
    256
}

fn default_min_salt_len() -> usize {
    16
}

fn default_salt_len() -> usize {
    16
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_token_secret() -> String {
    "change-me-in-production".to_string()
}

fn default_session_ttl_secs() -> u64 {
    24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}
