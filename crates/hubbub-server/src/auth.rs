//! Admin sessions.
//!
//! The admin password is configured as a hex SHA-256 digest. A successful
//! login mints a random session token that stays valid for
//! [`SESSION_LIFETIME`].

use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long a session token stays valid.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(10 * 60 * 60);

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "admin_session";

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Wrong password, or no admin password configured.
    #[error("Unauthorized")]
    Unauthorized,
    /// Unknown or expired session token.
    #[error("Invalid session")]
    Invalid,
}

/// Issued admin sessions.
#[derive(Debug)]
pub struct AdminSessions {
    password_digest: Option<String>,
    sessions: DashMap<String, Instant>,
}

impl AdminSessions {
    /// Create a session table. `None` disables login.
    #[must_use]
    pub fn new(password_sha256: Option<String>) -> Self {
        Self {
            password_digest: password_sha256.map(|d| d.trim().to_ascii_lowercase()),
            sessions: DashMap::new(),
        }
    }

    /// Check `password` and issue a session token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthorized`] on a wrong password or when no
    /// password is configured.
    pub fn login(&self, password: &str) -> Result<String, AuthError> {
        let Some(expected) = &self.password_digest else {
            warn!("Admin login attempted with no password configured");
            return Err(AuthError::Unauthorized);
        };

        if sha256_hex(password.as_bytes()) != *expected {
            warn!("Admin login failed");
            return Err(AuthError::Unauthorized);
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = to_hex(&raw);

        self.purge_expired();
        self.sessions
            .insert(token.clone(), Instant::now() + SESSION_LIFETIME);
        debug!(sessions = self.sessions.len(), "Admin session issued");
        Ok(token)
    }

    /// Check that `token` names a live session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Invalid`] for unknown or expired tokens.
    pub fn is_admin_session(&self, token: &str) -> Result<(), AuthError> {
        let expired = match self.sessions.get(token) {
            Some(expires) if *expires > Instant::now() => return Ok(()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove(token);
        }
        Err(AuthError::Invalid)
    }

    /// Number of sessions not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.sessions.retain(|_, expires| *expires > now);
    }
}

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
