//! Bearer token lookup.
//!
//! The transport never logs in; it only asks a [`CredentialSource`] for the
//! current token each time it opens a connection.

use std::sync::OnceLock;

use parking_lot::RwLock;
use secrecy::SecretString;

/// Environment variable read by [`EnvToken::default`].
pub const TOKEN_ENV_VAR: &str = "COURIER_TOKEN";

/// Synchronous lookup of the current bearer token.
pub trait CredentialSource: Send + Sync {
    /// The token to authenticate the next connection with, if any.
    fn bearer_token(&self) -> Option<SecretString>;
}

/// Process-wide mutable token slot, written by whatever handles login.
#[derive(Default)]
pub struct CredentialStore {
    token: RwLock<Option<SecretString>>,
}

static GLOBAL_STORE: OnceLock<CredentialStore> = OnceLock::new();

impl CredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared store for this process.
    pub fn global() -> &'static CredentialStore {
        GLOBAL_STORE.get_or_init(CredentialStore::new)
    }

    /// Replace the stored token. Blank tokens clear the slot.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        *self.token.write() = if token.trim().is_empty() {
            None
        } else {
            Some(SecretString::from(token))
        };
    }

    /// Forget the stored token (logout).
    pub fn clear(&self) {
        *self.token.write() = None;
    }

    /// Whether a token is currently stored.
    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_token", &self.has_token())
            .finish()
    }
}

impl CredentialSource for CredentialStore {
    fn bearer_token(&self) -> Option<SecretString> {
        self.token.read().clone()
    }
}

impl CredentialSource for &'static CredentialStore {
    fn bearer_token(&self) -> Option<SecretString> {
        (*self).bearer_token()
    }
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken([REDACTED])")
    }
}

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// Reads the token from an environment variable on every lookup.
#[derive(Clone, Debug)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

impl CredentialSource for EnvToken {
    fn bearer_token(&self) -> Option<SecretString> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn store_starts_empty() {
        let store = CredentialStore::new();
        assert!(!store.has_token());
        assert!(store.bearer_token().is_none());
    }

    #[test]
    fn store_set_and_clear() {
        let store = CredentialStore::new();
        store.set("tok-1");
        assert_eq!(store.bearer_token().unwrap().expose_secret(), "tok-1");
        store.set("tok-2");
        assert_eq!(store.bearer_token().unwrap().expose_secret(), "tok-2");
        store.clear();
        assert!(store.bearer_token().is_none());
    }

    #[test]
    fn blank_token_clears() {
        let store = CredentialStore::new();
        store.set("tok");
        store.set("   ");
        assert!(!store.has_token());
    }

    #[test]
    fn debug_never_prints_token() {
        let store = CredentialStore::new();
        store.set("super-secret");
        assert!(!format!("{store:?}").contains("super-secret"));
        let fixed = StaticToken::new("super-secret");
        assert!(!format!("{fixed:?}").contains("super-secret"));
    }

    #[test]
    fn static_token_always_present() {
        let fixed = StaticToken::new("abc");
        assert_eq!(fixed.bearer_token().unwrap().expose_secret(), "abc");
    }

    #[test]
    fn env_token_missing_var_is_none() {
        let source = EnvToken::new("COURIER_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert!(source.bearer_token().is_none());
    }

    #[test]
    fn global_store_is_shared() {
        let a: *const CredentialStore = CredentialStore::global();
        let b: *const CredentialStore = CredentialStore::global();
        assert_eq!(a, b);
    }
}
