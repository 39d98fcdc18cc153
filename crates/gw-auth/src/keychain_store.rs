use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::credentials::{Credential, sanitize_server_name};
use crate::errors::{GwAuthError, Result};
use crate::store::{CredentialStore, SecureCredentialStore};

pub const DEFAULT_KEYCHAIN_SERVICE: &str = "google-workspace-extension-oauth";

/// Reserved account holding the JSON list of stored server names.
/// The keychain cannot enumerate entries.
const INDEX_ACCOUNT: &str = "__server_index__";
/// Reserved account used by the availability check
const CHECK_ACCOUNT: &str = "__availability_check__";

/// Raw secret storage addressed by service and account
#[async_trait::async_trait]
pub trait KeychainBackend: Send + Sync {
    async fn get(&self, service: &str, account: &str) -> Result<Option<String>>;

    async fn set(&self, service: &str, account: &str, secret: &str) -> Result<()>;

    /// Returns `false` when there was nothing to delete
    async fn delete(&self, service: &str, account: &str) -> Result<bool>;
}

/// Keychain account for a server name.
///
/// The readable part is sanitized and therefore lossy, the hex suffix keeps
/// distinct names on distinct accounts. The `.` separator never appears in
/// the reserved accounts.
pub fn keychain_account(server_name: &str) -> String {
    format!(
        "{}.{}",
        sanitize_server_name(server_name),
        hex::encode(server_name)
    )
}

/// OS keychain credential store
///
/// Each credential is a JSON secret stored under [`keychain_account`]:
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service, with kernel keyutils as a session cache
#[derive(Clone)]
pub struct KeychainCredentialStore {
    service: String,
    backend: Arc<dyn KeychainBackend>,
}

impl Default for KeychainCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEYCHAIN_SERVICE)
    }
}

impl fmt::Debug for KeychainCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeychainCredentialStore")
            .field("service", &self.service)
            .finish()
    }
}

impl KeychainCredentialStore {
    /// Store backed by the OS keychain
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_backend(service, Arc::new(OsKeychain))
    }

    pub fn with_backend(service: impl Into<String>, backend: Arc<dyn KeychainBackend>) -> Self {
        Self {
            service: service.into(),
            backend,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    async fn read_index(&self) -> Result<BTreeSet<String>> {
        match self.backend.get(&self.service, INDEX_ACCOUNT).await? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| GwAuthError::Keychain(format!("Corrupted server index: {}", e))),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn write_index(&self, index: &BTreeSet<String>) -> Result<()> {
        if index.is_empty() {
            return self
                .backend
                .delete(&self.service, INDEX_ACCOUNT)
                .await
                .map(|_| ());
        }
        let json = serde_json::to_string(index)?;
        self.backend.set(&self.service, INDEX_ACCOUNT, &json).await
    }
}

#[async_trait::async_trait]
impl CredentialStore for KeychainCredentialStore {
    #[instrument(skip(self))]
    async fn get_credentials(&self, server_name: &str) -> Result<Option<Credential>> {
        let account = keychain_account(server_name);
        let Some(json) = self.backend.get(&self.service, &account).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Credential>(&json) {
            Ok(credential) if credential.server_name == server_name => Ok(Some(credential)),
            Ok(credential) => {
                warn!(
                    "Keychain entry {} belongs to '{}', ignoring it",
                    account, credential.server_name
                );
                Ok(None)
            }
            Err(e) => {
                warn!("Keychain entry {} holds invalid data: {}", account, e);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, credentials), fields(server_name = %credentials.server_name))]
    async fn set_credentials(&self, credentials: &Credential) -> Result<()> {
        credentials.validate()?;

        let account = keychain_account(&credentials.server_name);
        let json = zeroize::Zeroizing::new(serde_json::to_string(credentials)?);
        self.backend.set(&self.service, &account, &json).await?;

        let mut index = self.read_index().await?;
        if index.insert(credentials.server_name.clone()) {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_credentials(&self, server_name: &str) -> Result<()> {
        let account = keychain_account(server_name);
        if !self.backend.delete(&self.service, &account).await? {
            return Err(GwAuthError::CredentialsNotFound(server_name.to_string()));
        }

        let mut index = self.read_index().await?;
        if index.remove(server_name) {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        Ok(self.read_index().await?.into_iter().collect())
    }

    async fn get_all_credentials(&self) -> Result<HashMap<String, Credential>> {
        let mut all = HashMap::new();
        for server_name in self.read_index().await? {
            if let Some(credential) = self.get_credentials(&server_name).await? {
                all.insert(server_name, credential);
            }
        }
        Ok(all)
    }

    #[instrument(skip(self))]
    async fn clear_all(&self) -> Result<()> {
        let index = self.read_index().await?;
        let mut failures = Vec::new();

        for server_name in &index {
            let account = keychain_account(server_name);
            if let Err(e) = self.backend.delete(&self.service, &account).await {
                failures.push(format!("{}: {}", server_name, e));
            }
        }

        if !failures.is_empty() {
            return Err(GwAuthError::Keychain(format!(
                "Failed to clear some credentials: {}",
                failures.join(", ")
            )));
        }

        self.backend.delete(&self.service, INDEX_ACCOUNT).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecureCredentialStore for KeychainCredentialStore {
    /// Write, read back and delete a random secret
    async fn is_available(&self) -> bool {
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            return false;
        }
        let nonce = hex::encode(bytes);

        if let Err(e) = self.backend.set(&self.service, CHECK_ACCOUNT, &nonce).await {
            debug!("Keychain unavailable: {}", e);
            return false;
        }

        let available = match self.backend.get(&self.service, CHECK_ACCOUNT).await {
            Ok(Some(stored)) if stored == nonce => true,
            Ok(other) => {
                warn!(
                    "Keychain roundtrip failed (read back {}), using file storage",
                    if other.is_some() { "a different value" } else { "nothing" }
                );
                false
            }
            Err(e) => {
                warn!("Keychain roundtrip read failed ({}), using file storage", e);
                false
            }
        };

        if let Err(e) = self.backend.delete(&self.service, CHECK_ACCOUNT).await {
            debug!("Failed to remove keychain check entry: {}", e);
        }

        available
    }
}

/// The platform keychain through the `keyring` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeychain;

#[cfg(feature = "keyring-support")]
mod os {
    use crate::errors::{GwAuthError, Result};

    pub(super) fn entry(service: &str, account: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(service, account)
            .map_err(|e| GwAuthError::Keychain(format!("Failed to access keychain: {}", e)))
    }

    /// Keychain calls block, keep them off the runtime threads
    pub(super) async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| GwAuthError::Keychain(format!("Keychain task failed: {}", e)))?
    }
}

#[cfg(feature = "keyring-support")]
#[async_trait::async_trait]
impl KeychainBackend for OsKeychain {
    async fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
        let (service, account) = (service.to_string(), account.to_string());
        os::blocking(move || match os::entry(&service, &account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(GwAuthError::Keychain(format!(
                "Failed to read from keychain: {}",
                e
            ))),
        })
        .await
    }

    async fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        let (service, account) = (service.to_string(), account.to_string());
        let secret = zeroize::Zeroizing::new(secret.to_string());
        os::blocking(move || {
            os::entry(&service, &account)?
                .set_password(&secret)
                .map_err(|e| GwAuthError::Keychain(format!("Failed to write to keychain: {}", e)))
        })
        .await
    }

    async fn delete(&self, service: &str, account: &str) -> Result<bool> {
        let (service, account) = (service.to_string(), account.to_string());
        os::blocking(move || match os::entry(&service, &account)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(GwAuthError::Keychain(format!(
                "Failed to delete from keychain: {}",
                e
            ))),
        })
        .await
    }
}

#[cfg(not(feature = "keyring-support"))]
#[async_trait::async_trait]
impl KeychainBackend for OsKeychain {
    async fn get(&self, _service: &str, _account: &str) -> Result<Option<String>> {
        Err(GwAuthError::KeychainUnavailable)
    }

    async fn set(&self, _service: &str, _account: &str, _secret: &str) -> Result<()> {
        Err(GwAuthError::KeychainUnavailable)
    }

    async fn delete(&self, _service: &str, _account: &str) -> Result<bool> {
        Err(GwAuthError::KeychainUnavailable)
    }
}
