//! sysgate authentication core
//!
//! Password hashing, credential storage, session tracking and capability
//! checks for a single logical user identity. Callers pass an explicit session
//! id or signed handle on every request; there is no ambient current user.

pub mod authenticator;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod password;
pub mod session;
pub mod store;
pub mod token;

pub use authenticator::{Authenticator, CreateUser, IssuedSession};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, HashConfig};
pub use error::AuthError;
pub use gate::{AccessGate, Capability, Decision, DenyReason};
pub use password::HashCodec;
pub use session::{SessionRecord, SessionRegistry, spawn_sweep_task};
pub use store::{CredentialStore, UserRepository};
pub use token::{Claims, SessionSigner};
