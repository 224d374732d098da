//! Bearer tokens for the cloud relay.
//!
//! Transports only ever read tokens through [`Authenticator`]. Obtaining a
//! token is someone else's job; the CLI can store one by hand.

use chrono::{DateTime, TimeDelta, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::keyring::KeyringAccessError;

const KEYRING_SERVICE: &str = "localbridge";
const KEYRING_ACCOUNT: &str = "relay-token";
pub const TOKEN_ENV_VAR: &str = "LOCALBRIDGE_RELAY_TOKEN";

/// Tokens that expire within this many minutes are treated as already
/// expired.
pub const EXPIRY_BUFFER_MINUTES: i64 = 5;

pub trait Authenticator: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn is_authenticated(&self) -> bool;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    token: Option<String>,
}

impl StaticAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl Authenticator for StaticAuthenticator {
    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    /// A token expiring `seconds` from now, or `None` when that instant is
    /// not representable.
    pub fn expiring_in(access_token: impl Into<String>, seconds: i64) -> Option<Self> {
        let expires_at = Utc::now().checked_add_signed(TimeDelta::try_seconds(seconds)?)?;
        Some(Self {
            access_token: access_token.into(),
            expires_at: Some(expires_at),
        })
    }

    /// True when the token outlives `now` plus the expiry buffer. Tokens
    /// without an expiry never go stale.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return true;
        };
        TimeDelta::try_minutes(EXPIRY_BUFFER_MINUTES)
            .and_then(|buffer| now.checked_add_signed(buffer))
            .is_some_and(|deadline| expires_at > deadline)
    }
}

/// Reads the relay token from the OS keyring, falling back to an
/// environment variable.
#[derive(Debug, Clone)]
pub struct KeyringAuthenticator {
    use_keyring: bool,
    env_var: String,
}

impl Default for KeyringAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyringAuthenticator {
    pub fn new() -> Self {
        Self {
            use_keyring: true,
            env_var: TOKEN_ENV_VAR.to_string(),
        }
    }

    pub fn new_with_keyring(use_keyring: bool) -> Self {
        Self {
            use_keyring,
            ..Self::new()
        }
    }

    pub fn with_env_var(mut self, env_var: impl Into<String>) -> Self {
        self.env_var = env_var.into();
        self
    }

    pub fn load_token(&self) -> Result<Option<StoredToken>, KeyringAccessError> {
        if !self.use_keyring {
            return Ok(None);
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyringAccessError::from(err)),
        }
    }

    pub fn store_token(&self, token: &StoredToken) -> Result<(), KeyringAccessError> {
        if !self.use_keyring {
            return Ok(());
        }

        let secret = serde_json::to_string(token)?;
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)?;
        entry.set_password(&secret).map_err(KeyringAccessError::from)
    }

    /// Returns whether a stored token was removed.
    pub fn clear(&self) -> Result<bool, KeyringAccessError> {
        if !self.use_keyring {
            return Ok(false);
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)?;
        match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(err) => Err(KeyringAccessError::from(err)),
        }
    }

    fn fresh_token(&self) -> Option<StoredToken> {
        let stored = match self.load_token() {
            Ok(stored) => stored,
            Err(err) => {
                debug!(error = %err, recoverable = err.is_recoverable(), "Keyring lookup failed");
                None
            }
        };

        stored
            .filter(|token| token.is_fresh_at(Utc::now()))
            .or_else(|| {
                std::env::var(&self.env_var)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| StoredToken::new(value.trim()))
            })
    }
}

impl Authenticator for KeyringAuthenticator {
    fn access_token(&self) -> Option<String> {
        self.fresh_token().map(|token| token.access_token)
    }

    fn is_authenticated(&self) -> bool {
        self.fresh_token().is_some()
    }
}
