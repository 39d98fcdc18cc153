use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::credentials::Credential;
use crate::errors::{GwAuthError, Result};

/// CRUD surface shared by every credential backend
///
/// Lookups of absent entries return `None` or an empty result. Deleting an
/// absent entry is an error.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the credentials stored under `server_name`
    async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>>;

    /// Validate and store credentials, keeping other servers' entries
    async fn set_credentials(&self, credentials: &Credential) -> Result<()>;

    /// Remove the credentials stored under `server_name`
    async fn delete_credentials(&self, server_name: &str) -> Result<()>;

    /// List every stored server name
    async fn list_servers(&self) -> Result<Vec<String>>;

    /// Load every stored credential keyed by server name
    async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>>;

    /// Remove every stored credential
    async fn clear_all(&self) -> Result<()>;
}

/// Backend that may be missing on the host, such as the OS keychain
#[async_trait::async_trait]
pub trait SecureCredentialStore: CredentialStore {
    /// Check the backend. Never fails, any problem reports `false`.
    async fn is_available(&self) -> bool;
}

/// In-memory credential store for testing and simple use cases
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    credentials: Arc<RwLock<HashMap<String, Credential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            credentials: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

fn poisoned<T>(_: T) -> GwAuthError {
    GwAuthError::InvalidResponse("Lock poisoned".to_string())
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>> {
        Ok(self
            .credentials
            .read()
            .map_err(poisoned)?
            .get(server_name)
            .cloned())
    }

    async fn set_credentials(&self, credentials: &Credential) -> Result<()> {
        credentials.validate()?;
        self.credentials
            .write()
            .map_err(poisoned)?
            .insert(credentials.server_name.clone(), credentials.clone());
        Ok(())
    }

    async fn delete_credentials(&self, server_name: &str) -> Result<()> {
        self.credentials
            .write()
            .map_err(poisoned)?
            .remove(server_name)
            .map(|_| ())
            .ok_or_else(|| GwAuthError::CredentialsNotFound(server_name.to_string()))
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        Ok(self
            .credentials
            .read()
            .map_err(poisoned)?
            .keys()
            .cloned()
            .collect())
    }

    async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>> {
        Ok(self.credentials.read().map_err(poisoned)?.clone())
    }

    async fn clear_all(&self) -> Result<()> {
        self.credentials.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{DEFAULT_TOKEN_TYPE, OAuthToken};

    fn credential(server_name: &str) -> Credential {
        let token = OAuthToken::new(
            Some("access".to_string()),
            None,
            DEFAULT_TOKEN_TYPE,
            None,
            None,
        )
        .unwrap();
        Credential::new(server_name, token).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryCredentialStore::new();
        assert!(store.get_credentials("a").await.unwrap().is_none());

        store.set_credentials(&credential("a")).await.unwrap();
        store.set_credentials(&credential("b")).await.unwrap();

        let mut servers = store.list_servers().await.unwrap();
        servers.sort();
        assert_eq!(servers, vec!["a", "b"]);

        store.delete_credentials("a").await.unwrap();
        assert!(store.get_credentials("a").await.unwrap().is_none());
        assert!(store.get_credentials("b").await.unwrap().is_some());

        store.clear_all().await.unwrap();
        assert!(store.get_all_credentials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_delete_missing() {
        let store = MemoryCredentialStore::new();
        let result = store.delete_credentials("missing").await;
        assert!(matches!(result, Err(GwAuthError::CredentialsNotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_invalid() {
        let store = MemoryCredentialStore::new();
        let mut invalid = credential("a");
        invalid.server_name = String::new();

        assert!(store.set_credentials(&invalid).await.is_err());
        assert!(store.list_servers().await.unwrap().is_empty());
    }
}
