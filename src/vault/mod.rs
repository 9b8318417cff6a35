use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret store failure: {0}")]
    Backend(String),
}

/// Key/value capability for credential payloads.
///
/// The SQL-backed store keeps only entry metadata in the relational table;
/// the credential JSON goes through this interface. Injected at construction
/// so deployments can wire an external vault without the store knowing.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), SecretStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, SecretStoreError>;

    /// Deleting an absent key reports `NotFound` so paired deletes can
    /// surface a dangling reference instead of hiding it.
    async fn delete(&self, key: &str) -> Result<(), SecretStoreError>;
}

/// Process-local secret store used by default wiring and tests.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.secrets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), SecretStoreError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SecretStoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretStoreError> {
        match self.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(SecretStoreError::NotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let store = InMemorySecretStore::new();
        store.put("edr--1", r#"{"id":"1"}"#).await.unwrap();
        assert_eq!(store.get("edr--1").await.unwrap().as_deref(), Some(r#"{"id":"1"}"#));

        store.delete("edr--1").await.unwrap();
        assert_eq!(store.get("edr--1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing_value() {
        let store = InMemorySecretStore::new();
        store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn delete_of_absent_key_reports_not_found() {
        let store = InMemorySecretStore::new();
        let err = store.delete("missing").await.unwrap_err();
        assert!(matches!(err, SecretStoreError::NotFound(_)));
    }
}
