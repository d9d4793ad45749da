//! Opaque credential storage for the console session
//!
//! The session keeps exactly two string entries, the access and refresh
//! tokens. The invariant is both-present-or-both-absent: login writes the
//! pair, [`CredentialStore::clear_tokens`] removes the pair, and nothing
//! else touches them outside a refresh.

use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;

/// Storage key for the bearer access token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Storage key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential backend error: {0}")]
    Backend(String),
}

/// Opaque key-value store holding the session credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove both token entries. Both removals are attempted even when
    /// the first fails, so from the caller's perspective the pair is gone.
    fn clear_tokens(&self) -> Result<(), StoreError> {
        let access = self.remove(ACCESS_TOKEN_KEY);
        let refresh = self.remove(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }
}

/// Production store backed by the OS keyring.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Create a store scoped to a keyring service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());

        store.set(ACCESS_TOKEN_KEY, "abc").unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("abc"));

        store.remove(ACCESS_TOKEN_KEY).unwrap();
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn removing_a_missing_key_is_fine() {
        let store = MemoryStore::new();
        store.remove("never-set").unwrap();
    }

    #[test]
    fn clear_tokens_removes_the_pair() {
        let store = MemoryStore::new();
        store.set(ACCESS_TOKEN_KEY, "a").unwrap();
        store.set(REFRESH_TOKEN_KEY, "r").unwrap();

        store.clear_tokens().unwrap();

        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).unwrap().is_none());
    }
}
