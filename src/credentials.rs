//! Bearer-token lookup for replayed requests.
//!
//! The session itself is owned by the auth layer; this module only reads the
//! current token at call time so a rotation between enqueue and replay is
//! picked up. Production reads from the OS credential store (Keychain, DPAPI,
//! kernel keyring) via the `keyring` crate.

use keyring::Entry;
use std::sync::RwLock;
use tracing::warn;
use zeroize::Zeroizing;

pub const SERVICE_NAME: &str = "water-admin";
pub const KEY_AUTH_TOKEN: &str = "auth_token";

/// Anything that can hand out the current session token.
pub trait TokenSource: Send + Sync {
    /// Current token, or `None` when no session exists.
    fn bearer_token(&self) -> Option<Zeroizing<String>>;
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

pub struct KeyringTokenSource {
    service: String,
    key: String,
}

impl KeyringTokenSource {
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
        }
    }
}

impl Default for KeyringTokenSource {
    fn default() -> Self {
        Self::new(SERVICE_NAME, KEY_AUTH_TOKEN)
    }
}

impl TokenSource for KeyringTokenSource {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        let entry = match Entry::new(&self.service, &self.key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key = %self.key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) if !pw.trim().is_empty() => Some(Zeroizing::new(pw)),
            Ok(_) | Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key = %self.key, error = %e, "keyring: failed to read token");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process session
// ---------------------------------------------------------------------------

/// Token held in memory, replaced by the auth layer on login/refresh.
#[derive(Default)]
pub struct SessionToken {
    token: RwLock<Option<Zeroizing<String>>>,
}

impl SessionToken {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: RwLock::new(token.map(|t| Zeroizing::new(t.to_string()))),
        }
    }

    pub fn set(&self, token: &str) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(Zeroizing::new(token.to_string()));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl TokenSource for SessionToken {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        self.token.read().ok()?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_token_rotation() {
        let session = SessionToken::new(Some("old"));
        assert_eq!(session.bearer_token().as_deref().map(String::as_str), Some("old"));

        session.set("new");
        assert_eq!(session.bearer_token().as_deref().map(String::as_str), Some("new"));

        session.clear();
        assert!(session.bearer_token().is_none());
    }
}
