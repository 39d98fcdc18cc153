use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::errors::{GwAuthError, Result};

/// Owner-only permissions for the key file
#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o600;
/// Owner-only permissions for the storage directory
#[cfg(unix)]
pub(crate) const STORAGE_DIR_MODE: u32 = 0o700;

/// Manages the installation-wide master key
///
/// The key is 32 random bytes stored hex-encoded. It is created lazily the
/// first time it is needed and never rotated.
#[derive(Debug, Clone)]
pub struct KeyManager {
    key_path: PathBuf,
}

impl KeyManager {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Read the master key, creating it if the file does not exist yet.
    ///
    /// Only a missing file triggers generation. Any other read error, or a
    /// key file with unexpected content, is returned as-is so existing
    /// encrypted data is never orphaned by a silent regeneration.
    #[instrument(skip(self), fields(path = %self.key_path.display()))]
    pub async fn load_or_create(&self) -> Result<EncryptionKey> {
        match fs::read(&self.key_path).await {
            Ok(content) => {
                debug!("Loaded master key");
                parse_key(&Zeroizing::new(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => self.create().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self) -> Result<EncryptionKey> {
        if let Some(parent) = self.key_path.parent() {
            create_private_dir(parent).await?;
        }

        let key = EncryptionKey::generate()?;
        let encoded = Zeroizing::new(hex::encode(key.as_bytes()));

        let mut options = fs::OpenOptions::new();
        // create_new: an existing key is never overwritten
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(KEY_FILE_MODE);

        let mut file = match options.open(&self.key_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another process won the race, use its key
                let content = Zeroizing::new(fs::read(&self.key_path).await?);
                return parse_key(&content);
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(encoded.as_bytes()).await?;
        file.sync_all().await?;

        info!("Created new master key at {}", self.key_path.display());
        Ok(key)
    }
}

fn parse_key(content: &[u8]) -> Result<EncryptionKey> {
    let text = std::str::from_utf8(content)
        .map_err(|_| GwAuthError::CorruptedMasterKey("not valid UTF-8".to_string()))?;

    let bytes = Zeroizing::new(
        hex::decode(text.trim())
            .map_err(|e| GwAuthError::CorruptedMasterKey(format!("invalid hex: {}", e)))?,
    );

    if bytes.len() != KEY_LEN {
        return Err(GwAuthError::CorruptedMasterKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(EncryptionKey::from_bytes(key))
}

/// Create `dir` (and parents) with owner-only permissions if it is missing
pub(crate) async fn create_private_dir(dir: &Path) -> Result<()> {
    if fs::metadata(dir).await.is_ok() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(STORAGE_DIR_MODE);
    builder.create(dir).await?;

    debug!("Created storage directory {}", dir.display());
    Ok(())
}
