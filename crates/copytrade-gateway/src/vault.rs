//! Credential vault interface.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Broker login pair handed to a gateway container.
///
/// The password is wiped from memory on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Broker username.
    pub username: String,
    /// Broker password; absent when the container handles its own login flow.
    pub password: Option<String>,
}

impl Credentials {
    /// Credentials with a password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// Credentials carrying only a username.
    #[must_use]
    pub fn username_only(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

/// Errors from the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The vault could not be reached or answered with a server error.
    #[error("vault unavailable: {0}")]
    Unavailable(String),

    /// No secret exists under the reference.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The secret exists but lacks a username/password pair.
    #[error("malformed secret {secret_ref}: {reason}")]
    Malformed {
        /// Secret reference.
        secret_ref: String,
        /// What was wrong.
        reason: String,
    },
}

/// Secret store holding broker credentials.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Fetch the credential pair stored under `secret_ref`.
    async fn get_credentials(&self, secret_ref: &str) -> Result<Credentials, VaultError>;
}
