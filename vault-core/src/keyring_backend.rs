//! Keyring façade: abstract get/list over an OS-keychain backend.
//!
//! A trait lets the Keychain health checker be driven by either the real
//! (non-enumerable) backend or a test double that implements `list`. This
//! asymmetry is deliberate: orphan detection only runs when `list` is
//! available.

use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("no entry found for {service}/{account}")]
    NotFound { service: String, account: String },
    #[error("enumeration unsupported by this backend")]
    EnumerationUnsupported,
    #[error("keyring backend error: {0}")]
    Backend(String),
}

pub trait KeyringBackend: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Result<String, KeyringError>;
    fn list(&self, service: &str) -> Result<Vec<(String, String)>, KeyringError>;
}

/// Production backend wrapping the OS keychain via the `keyring` crate.
/// Real OS keychains (macOS Keychain, Windows Credential Manager, Secret
/// Service) offer no enumeration API, so `list` always reports unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyringBackend;

impl KeyringBackend for OsKeyringBackend {
    fn get(&self, service: &str, account: &str) -> Result<String, KeyringError> {
        let entry = Entry::new(service, account)
            .map_err(|e| KeyringError::Backend(e.to_string()))?;
        entry.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => KeyringError::NotFound {
                service: service.to_string(),
                account: account.to_string(),
            },
            other => KeyringError::Backend(other.to_string()),
        })
    }

    fn list(&self, _service: &str) -> Result<Vec<(String, String)>, KeyringError> {
        Err(KeyringError::EnumerationUnsupported)
    }
}

/// Test double backed by an in-memory map. Implements `list`, unlike the
/// production backend, so the Keychain checker's orphan-detection path can
/// be exercised deterministically.
#[derive(Debug, Default)]
pub struct MockKeyringBackend {
    entries: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MockKeyringBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service: &str, account: &str, secret: &str) {
        self.entries
            .lock()
            .entry(service.to_string())
            .or_default()
            .insert(account.to_string(), secret.to_string());
    }
}

impl KeyringBackend for MockKeyringBackend {
    fn get(&self, service: &str, account: &str) -> Result<String, KeyringError> {
        self.entries
            .lock()
            .get(service)
            .and_then(|accounts| accounts.get(account).cloned())
            .ok_or_else(|| KeyringError::NotFound {
                service: service.to_string(),
                account: account.to_string(),
            })
    }

    fn list(&self, service: &str) -> Result<Vec<(String, String)>, KeyringError> {
        Ok(self
            .entries
            .lock()
            .get(service)
            .map(|accounts| {
                accounts
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_backend_get_and_list_round_trip() {
        let backend = MockKeyringBackend::new();
        backend.insert("svc", "acct1", "/path/to/vault");
        assert_eq!(backend.get("svc", "acct1").unwrap(), "/path/to/vault");
        let listed = backend.list("svc").unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn mock_backend_missing_entry_is_not_found() {
        let backend = MockKeyringBackend::new();
        assert!(matches!(
            backend.get("svc", "missing"),
            Err(KeyringError::NotFound { .. })
        ));
    }

    #[test]
    fn mock_backend_list_unknown_service_is_empty() {
        let backend = MockKeyringBackend::new();
        assert!(backend.list("unknown").unwrap().is_empty());
    }
}
