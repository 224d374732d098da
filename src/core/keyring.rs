use std::error::Error;
use std::fmt;

/// Describes failures when attempting to access the system keyring.
///
/// Recoverable errors indicate that the credential backend was
/// temporarily unavailable (for example when the keychain service is
/// locked or inaccessible). Permanent errors surface the underlying
/// cause directly so callers can report them to the user.
#[derive(Debug)]
pub enum KeyringAccessError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
    /// The stored secret is not a token record this crate wrote.
    Corrupt(serde_json::Error),
}

impl KeyringAccessError {
    /// Returns true when the error represents a temporary outage of the
    /// platform keyring backend.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KeyringAccessError::Recoverable(_))
    }
}

impl From<keyring::Error> for KeyringAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                KeyringAccessError::Recoverable(err)
            }
            other => KeyringAccessError::Permanent(other),
        }
    }
}

impl From<serde_json::Error> for KeyringAccessError {
    fn from(err: serde_json::Error) -> Self {
        KeyringAccessError::Corrupt(err)
    }
}

impl fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyringAccessError::Recoverable(err) | KeyringAccessError::Permanent(err) => {
                write!(f, "{err}")
            }
            KeyringAccessError::Corrupt(err) => write!(f, "Stored relay token is unreadable: {err}"),
        }
    }
}

impl Error for KeyringAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            KeyringAccessError::Recoverable(err) | KeyringAccessError::Permanent(err) => Some(err),
            KeyringAccessError::Corrupt(err) => Some(err),
        }
    }
}
