use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::config::GwAuthConfig;
use crate::credentials::Credential;
use crate::errors::Result;
use crate::file_store::FileCredentialStore;
use crate::keychain_store::KeychainCredentialStore;
use crate::store::{CredentialStore, SecureCredentialStore};

/// Backend chosen by [`HybridCredentialStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Keychain,
    EncryptedFile,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Keychain => f.write_str("keychain"),
            StorageType::EncryptedFile => f.write_str("encrypted_file"),
        }
    }
}

/// Prefers the OS keychain and falls back to the encrypted file
///
/// The backend is chosen on first use and reused for the lifetime of the
/// store, so the keychain is checked at most once.
pub struct HybridCredentialStore {
    keychain: Arc<dyn SecureCredentialStore>,
    file: Arc<dyn CredentialStore>,
    force_file_storage: bool,
    selected: OnceCell<StorageType>,
}

impl HybridCredentialStore {
    pub fn new(
        keychain: Arc<dyn SecureCredentialStore>,
        file: Arc<dyn CredentialStore>,
        force_file_storage: bool,
    ) -> Self {
        Self {
            keychain,
            file,
            force_file_storage,
            selected: OnceCell::new(),
        }
    }

    /// Keychain plus encrypted file at the configured paths
    pub fn from_config(config: &GwAuthConfig) -> Self {
        Self::new(
            Arc::new(KeychainCredentialStore::default()),
            Arc::new(FileCredentialStore::new(
                &config.token_path,
                &config.master_key_path,
            )),
            config.force_file_storage,
        )
    }

    /// Which backend is active, selecting it if needed
    pub async fn get_storage_type(&self) -> StorageType {
        *self.selected.get_or_init(|| self.select()).await
    }

    async fn select(&self) -> StorageType {
        let selected = if self.force_file_storage {
            info!("File storage forced by configuration");
            StorageType::EncryptedFile
        } else if self.keychain.is_available().await {
            StorageType::Keychain
        } else {
            StorageType::EncryptedFile
        };

        info!("Using {} credential storage", selected);
        selected
    }

    async fn backend(&self) -> &dyn CredentialStore {
        match self.get_storage_type().await {
            StorageType::Keychain => self.keychain.as_ref(),
            StorageType::EncryptedFile => self.file.as_ref(),
        }
    }
}

impl fmt::Debug for HybridCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridCredentialStore")
            .field("force_file_storage", &self.force_file_storage)
            .field("selected", &self.selected.get())
            .finish()
    }
}

#[async_trait::async_trait]
impl CredentialStore for HybridCredentialStore {
    async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>> {
        self.backend().await.get_credentials(server_name).await
    }

    async fn set_credentials(&self, credentials: &Credential) -> Result<()> {
        self.backend().await.set_credentials(credentials).await
    }

    async fn delete_credentials(&self, server_name: &str) -> Result<()> {
        self.backend().await.delete_credentials(server_name).await
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        self.backend().await.list_servers().await
    }

    async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>> {
        self.backend().await.get_all_credentials().await
    }

    async fn clear_all(&self) -> Result<()> {
        self.backend().await.clear_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{DEFAULT_TOKEN_TYPE, OAuthToken};
    use crate::store::MemoryCredentialStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keychain double that counts availability checks
    struct FakeKeychain {
        available: bool,
        checks: AtomicUsize,
        inner: MemoryCredentialStore,
    }

    impl FakeKeychain {
        fn new(available: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                checks: AtomicUsize::new(0),
                inner: MemoryCredentialStore::new(),
            })
        }

        fn checks(&self) -> usize {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CredentialStore for FakeKeychain {
        async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>> {
            self.inner.get_credentials(server_name).await
        }
        async fn set_credentials(&self, credentials: &Credential) -> Result<()> {
            self.inner.set_credentials(credentials).await
        }
        async fn delete_credentials(&self, server_name: &str) -> Result<()> {
            self.inner.delete_credentials(server_name).await
        }
        async fn list_servers(&self) -> Result<Vec<String>> {
            self.inner.list_servers().await
        }
        async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>> {
            self.inner.get_all_credentials().await
        }
        async fn clear_all(&self) -> Result<()> {
            self.inner.clear_all().await
        }
    }

    #[async_trait::async_trait]
    impl SecureCredentialStore for FakeKeychain {
        async fn is_available(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.available
        }
    }

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
    async fn test_keychain_used_when_available_and_checked_once() {
        let keychain = FakeKeychain::new(true);
        let file = Arc::new(MemoryCredentialStore::new());
        let store = HybridCredentialStore::new(keychain.clone(), file.clone(), false);

        store.set_credentials(&credential("a")).await.unwrap();
        store.set_credentials(&credential("b")).await.unwrap();
        assert!(store.get_credentials("a").await.unwrap().is_some());
        assert_eq!(store.list_servers().await.unwrap().len(), 2);
        store.delete_credentials("a").await.unwrap();
        assert_eq!(store.get_all_credentials().await.unwrap().len(), 1);
        store.clear_all().await.unwrap();

        assert_eq!(store.get_storage_type().await, StorageType::Keychain);
        assert_eq!(keychain.checks(), 1);
        assert!(file.list_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_file_when_unavailable() {
        let keychain = FakeKeychain::new(false);
        let file = Arc::new(MemoryCredentialStore::new());
        let store = HybridCredentialStore::new(keychain.clone(), file.clone(), false);

        store.set_credentials(&credential("a")).await.unwrap();
        store.get_credentials("a").await.unwrap();

        assert_eq!(store.get_storage_type().await, StorageType::EncryptedFile);
        assert_eq!(keychain.checks(), 1);
        assert_eq!(file.list_servers().await.unwrap(), vec!["a"]);
        assert!(keychain.inner.list_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_file_storage_never_checks() {
        let keychain = FakeKeychain::new(true);
        let file = Arc::new(MemoryCredentialStore::new());
        let store = HybridCredentialStore::new(keychain.clone(), file.clone(), true);

        store.set_credentials(&credential("a")).await.unwrap();
        store.list_servers().await.unwrap();

        assert_eq!(store.get_storage_type().await, StorageType::EncryptedFile);
        assert_eq!(keychain.checks(), 0);
        assert_eq!(file.list_servers().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_checks_once() {
        let keychain = FakeKeychain::new(true);
        let store = Arc::new(HybridCredentialStore::new(
            keychain.clone(),
            Arc::new(MemoryCredentialStore::new()),
            false,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_credentials("x").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(keychain.checks(), 1);
    }

    #[test]
    fn test_storage_type_display() {
        assert_eq!(StorageType::Keychain.to_string(), "keychain");
        assert_eq!(StorageType::EncryptedFile.to_string(), "encrypted_file");
    }
}
