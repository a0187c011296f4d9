//! sysgate Database Layer
//!
//! This crate persists the `sys_user` table that backs authentication,
//! using SQLite via sqlx.

pub mod error;
pub mod models;
pub mod repository;
pub mod utils;

pub use error::DbError;
pub use models::*;
pub use repository::Database;
