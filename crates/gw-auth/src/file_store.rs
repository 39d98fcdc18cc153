use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::credentials::Credential;
use crate::crypto::{self, EncryptionKey};
use crate::errors::{GwAuthError, Result};
use crate::key_manager::{self, KeyManager};
use crate::store::CredentialStore;

#[cfg(unix)]
const TOKEN_FILE_MODE: u32 = 0o600;

type CredentialMap = HashMap<String, Credential>;

/// File-based encrypted credential store
///
/// The whole `serverName -> Credential` map is serialized as JSON,
/// encrypted with the master key and written to a single file.
///
/// # Directory Structure
/// ```text
/// <data dir>/
/// ├── master.key         # Hex-encoded master key (0600)
/// └── credentials.enc    # iv:tag:ciphertext (0600)
/// ```
///
/// Writers are last-writer-wins on the whole map; there is no cross-process
/// locking.
#[derive(Debug)]
pub struct FileCredentialStore {
    token_path: PathBuf,
    key_manager: KeyManager,
    key: OnceCell<EncryptionKey>,
}

impl FileCredentialStore {
    pub fn new(token_path: impl Into<PathBuf>, master_key_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
            key_manager: KeyManager::new(master_key_path),
            key: OnceCell::new(),
        }
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    async fn key(&self) -> Result<&EncryptionKey> {
        self.key
            .get_or_try_init(|| self.key_manager.load_or_create())
            .await
    }

    /// Read and decrypt the stored map.
    ///
    /// `Ok(None)` when the file is absent. Corrupted content (bad format,
    /// failed authentication, invalid JSON) also degrades to `Ok(None)`.
    async fn read_map(&self) -> Result<Option<CredentialMap>> {
        let content = match fs::read_to_string(&self.token_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let key = self.key().await?;

        let plaintext = match crypto::decrypt(&content, key) {
            Ok(plaintext) => zeroize::Zeroizing::new(plaintext),
            Err(e) => {
                warn!(
                    "Credential file {} could not be decrypted, treating as empty: {}",
                    self.token_path.display(),
                    e
                );
                return Ok(None);
            }
        };

        match serde_json::from_str::<CredentialMap>(&plaintext) {
            Ok(map) => Ok(Some(map)),
            Err(e) => {
                warn!(
                    "Credential file {} holds invalid data, treating as empty: {}",
                    self.token_path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Encrypt and atomically replace the stored map
    async fn write_map(&self, map: &CredentialMap) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            key_manager::create_private_dir(parent).await?;
        }

        let plaintext = zeroize::Zeroizing::new(serde_json::to_string(map)?);
        let key = self.key().await?;
        let encrypted = crypto::encrypt(&plaintext, key)?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.token_path.with_extension("tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(TOKEN_FILE_MODE);

        let mut file = options.open(&temp_path).await?;
        file.write_all(encrypted.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.token_path).await?;

        debug!(
            "Wrote {} credential(s) to {}",
            map.len(),
            self.token_path.display()
        );
        Ok(())
    }

    async fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.token_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self))]
    async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>> {
        Ok(self
            .read_map()
            .await?
            .and_then(|mut map| map.remove(server_name)))
    }

    #[instrument(skip(self, credentials), fields(server_name = %credentials.server_name))]
    async fn set_credentials(&self, credentials: &Credential) -> Result<()> {
        credentials.validate()?;

        let mut map = self.read_map().await?.unwrap_or_default();
        map.insert(credentials.server_name.clone(), credentials.clone());
        self.write_map(&map).await
    }

    #[instrument(skip(self))]
    async fn delete_credentials(&self, server_name: &str) -> Result<()> {
        let mut map = self
            .read_map()
            .await?
            .ok_or_else(|| GwAuthError::CredentialsNotFound(server_name.to_string()))?;

        if map.remove(server_name).is_none() {
            return Err(GwAuthError::CredentialsNotFound(server_name.to_string()));
        }

        if map.is_empty() {
            debug!("Last credential removed, deleting {}", self.token_path.display());
            self.remove_file().await
        } else {
            self.write_map(&map).await
        }
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        Ok(self
            .read_map()
            .await?
            .map(|map| map.into_keys().collect())
            .unwrap_or_default())
    }

    async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>> {
        Ok(self.read_map().await?.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn clear_all(&self) -> Result<()> {
        self.remove_file().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{DEFAULT_TOKEN_TYPE, OAuthToken};
    use tempfile::TempDir;

    fn create_test_store(temp: &TempDir) -> FileCredentialStore {
        FileCredentialStore::new(
            temp.path().join("data").join("credentials.enc"),
            temp.path().join("data").join("master.key"),
        )
    }

    fn credential(server_name: &str, access: &str) -> Credential {
        let token = OAuthToken::new(
            Some(access.to_string()),
            Some("refresh".to_string()),
            DEFAULT_TOKEN_TYPE,
            Some("scope.a scope.b".to_string()),
            Some(1_900_000_000_000),
        )
        .unwrap();
        Credential::new(server_name, token).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);

        assert!(store.get_credentials("main").await.unwrap().is_none());
        assert!(store.list_servers().await.unwrap().is_empty());
        assert!(store.get_all_credentials().await.unwrap().is_empty());
        // Nothing is created by reads
        assert!(!temp.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let saved = credential("main", "access-1");

        store.set_credentials(&saved).await.unwrap();
        let loaded = store.get_credentials("main").await.unwrap().unwrap();

        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_file_is_encrypted() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store
            .set_credentials(&credential("main", "very-secret-token"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.token_path()).unwrap();
        assert!(!raw.contains("very-secret-token"));
        assert_eq!(raw.split(':').count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.set_credentials(&credential("main", "a")).await.unwrap();

        let dir_mode = std::fs::metadata(temp.path().join("data"))
            .unwrap()
            .permissions()
            .mode();
        let file_mode = std::fs::metadata(store.token_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_set_preserves_other_servers() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let a = credential("server-a", "token-a");
        let b = credential("server-b", "token-b");

        store.set_credentials(&a).await.unwrap();
        store.set_credentials(&b).await.unwrap();

        assert_eq!(store.get_credentials("server-a").await.unwrap(), Some(a));
        assert_eq!(store.get_credentials("server-b").await.unwrap(), Some(b));

        let mut servers = store.list_servers().await.unwrap();
        servers.sort();
        assert_eq!(servers, vec!["server-a", "server-b"]);
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_before_io() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let mut invalid = credential("main", "a");
        invalid.token.access_token = None;
        invalid.token.refresh_token = None;

        let result = store.set_credentials(&invalid).await;

        assert!(matches!(result, Err(GwAuthError::InvalidCredentials(_))));
        assert!(!temp.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_delete_last_entry_removes_file() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.set_credentials(&credential("main", "a")).await.unwrap();

        store.delete_credentials("main").await.unwrap();

        assert!(!store.token_path().exists());
        assert!(store.get_credentials("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_one_of_two_rewrites_file() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        let keep = credential("keep", "a");
        store.set_credentials(&keep).await.unwrap();
        store.set_credentials(&credential("drop", "b")).await.unwrap();

        store.delete_credentials("drop").await.unwrap();

        assert!(store.token_path().exists());
        assert_eq!(store.get_credentials("keep").await.unwrap(), Some(keep));
        assert_eq!(store.list_servers().await.unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_an_error() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);

        let result = store.delete_credentials("main").await;
        assert!(matches!(result, Err(GwAuthError::CredentialsNotFound(_))));

        store.set_credentials(&credential("other", "a")).await.unwrap();
        let result = store.delete_credentials("main").await;
        assert!(matches!(result, Err(GwAuthError::CredentialsNotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupted_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.set_credentials(&credential("main", "a")).await.unwrap();

        std::fs::write(store.token_path(), "garbage").unwrap();
        assert!(store.get_credentials("main").await.unwrap().is_none());

        std::fs::write(store.token_path(), "00:11:22").unwrap();
        assert!(store.list_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_master_key_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);
        store.set_credentials(&credential("main", "a")).await.unwrap();

        let key_path = temp.path().join("data").join("master.key");
        std::fs::write(&key_path, hex::encode([9u8; 32])).unwrap();

        let fresh = create_test_store(&temp);
        assert!(fresh.get_credentials("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let temp = TempDir::new().unwrap();
        let store = create_test_store(&temp);

        // Tolerates a missing file
        store.clear_all().await.unwrap();

        store.set_credentials(&credential("a", "a")).await.unwrap();
        store.set_credentials(&credential("b", "b")).await.unwrap();
        store.clear_all().await.unwrap();

        assert!(!store.token_path().exists());
        assert!(store.list_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_survives_new_store_instance() {
        let temp = TempDir::new().unwrap();
        let saved = credential("main", "a");
        create_test_store(&temp).set_credentials(&saved).await.unwrap();

        let reopened = create_test_store(&temp);
        assert_eq!(reopened.get_credentials("main").await.unwrap(), Some(saved));
    }
}
