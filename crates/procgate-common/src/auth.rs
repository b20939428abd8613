//! Backend credentials and authentication challenges
//!
//! The gateway never authenticates users itself. It forwards credentials to
//! the backend and, when the backend refuses them, answers with a challenge
//! produced by a pluggable realm.

use crate::error::{GatewayError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;

/// Credentials presented to the backend on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Backend service or connect string
    pub connect_string: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            connect_string: None,
        }
    }

    /// Attach a connect string
    pub fn with_connect_string(mut self, connect: Option<String>) -> Self {
        self.connect_string = connect;
        self
    }

    /// Parse an `Authorization: Basic ...` header value
    pub fn from_basic_header(value: &str) -> Result<Self> {
        let encoded = value
            .trim()
            .strip_prefix("Basic ")
            .or_else(|| value.trim().strip_prefix("basic "))
            .ok_or_else(|| GatewayError::Auth {
                message: "unsupported authorization scheme".into(),
                recoverable: false,
            })?;

        let decoded = STANDARD.decode(encoded.trim()).map_err(|e| GatewayError::Auth {
            message: format!("malformed basic credentials: {}", e),
            recoverable: false,
        })?;
        let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::Auth {
            message: "basic credentials are not valid UTF-8".into(),
            recoverable: false,
        })?;

        let (username, password) = decoded.split_once(':').ok_or_else(|| GatewayError::Auth {
            message: "basic credentials lack a ':' separator".into(),
            recoverable: false,
        })?;

        Ok(Self::new(username, password))
    }
}

// Passwords stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connect_string", &self.connect_string)
            .finish()
    }
}

/// Produces the `WWW-Authenticate` value sent with a 401
pub trait RealmChallenge: Send + Sync {
    fn challenge(&self, location: &str) -> String;
}

/// Basic authentication realm
#[derive(Debug, Clone)]
pub struct BasicRealm {
    realm: String,
}

impl BasicRealm {
    pub fn new(realm: impl Into<String>) -> Self {
        Self { realm: realm.into() }
    }
}

impl RealmChallenge for BasicRealm {
    fn challenge(&self, location: &str) -> String {
        let realm = if self.realm.is_empty() { location } else { &self.realm };
        format!("Basic realm=\"{}\"", realm.replace('"', "'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_roundtrip() {
        let header = format!("Basic {}", STANDARD.encode("scott:tiger:x"));
        let creds = Credentials::from_basic_header(&header).unwrap();
        assert_eq!(creds.username, "scott");
        assert_eq!(creds.password, "tiger:x");
    }

    #[test]
    fn test_basic_header_rejects_other_schemes() {
        let err = Credentials::from_basic_header("Bearer abc").unwrap_err();
        assert!(matches!(err, GatewayError::Auth { recoverable: false, .. }));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("scott", "tiger");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("tiger"));
    }

    #[test]
    fn test_challenge_falls_back_to_location() {
        assert_eq!(BasicRealm::new("").challenge("app"), "Basic realm=\"app\"");
        assert_eq!(BasicRealm::new("Shop").challenge("app"), "Basic realm=\"Shop\"");
    }
}
