//! procgate Common Library
//!
//! Shared error, configuration and credential types for the gateway engine
//! and its front ends.

pub mod auth;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use auth::{BasicRealm, Credentials, RealmChallenge};
pub use config::LocationConfig;
pub use error::{GatewayError, Result};
