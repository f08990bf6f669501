//! Cached vault-unlock secrets, addressed by user id.

use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::SecretStoreError;

/// Calls are synchronous and issued one at a time by the dispatcher.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, user_id: &str) -> Result<Zeroizing<String>, SecretStoreError>;
    fn set_secret(&self, user_id: &str, value: &str) -> Result<(), SecretStoreError>;
    fn delete_secret(&self, user_id: &str) -> Result<(), SecretStoreError>;
}

/// OS credential vault: Secret Service on Linux, Keychain on macOS,
/// Credential Manager on Windows.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, user_id: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, user_id)
            .map_err(|e| SecretStoreError::Unavailable(format!("keyring init: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get_secret(&self, user_id: &str) -> Result<Zeroizing<String>, SecretStoreError> {
        match self.entry(user_id)?.get_password() {
            Ok(secret) => Ok(Zeroizing::new(secret)),
            Err(keyring::Error::NoEntry) => Err(SecretStoreError::NotFound(user_id.to_string())),
            Err(e) => Err(SecretStoreError::Unavailable(format!("load secret: {e}"))),
        }
    }

    fn set_secret(&self, user_id: &str, value: &str) -> Result<(), SecretStoreError> {
        self.entry(user_id)?
            .set_password(value)
            .map_err(|e| SecretStoreError::Unavailable(format!("store secret: {e}")))?;
        debug!(user_id, service = %self.service, "secret stored");
        Ok(())
    }

    fn delete_secret(&self, user_id: &str) -> Result<(), SecretStoreError> {
        match self.entry(user_id)?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Err(SecretStoreError::NotFound(user_id.to_string())),
            Err(e) => Err(SecretStoreError::Unavailable(format!("delete secret: {e}"))),
        }
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, user_id: &str) -> Result<Zeroizing<String>, SecretStoreError> {
        self.secrets
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(user_id.to_string()))
    }

    fn set_secret(&self, user_id: &str, value: &str) -> Result<(), SecretStoreError> {
        self.secrets
            .lock()
            .insert(user_id.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }

    fn delete_secret(&self, user_id: &str) -> Result<(), SecretStoreError> {
        self.secrets
            .lock()
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| SecretStoreError::NotFound(user_id.to_string()))
    }
}
