use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use zeroize::ZeroizeOnDrop;

use crate::errors::{GwAuthError, Result};

/// AES-GCM nonce size (96 bits)
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag size (128 bits)
pub const TAG_LEN: usize = 16;
/// AES-256 key size
pub const KEY_LEN: usize = 32;

const SEGMENT_DELIMITER: char = ':';

/// AES-256 key (32 bytes)
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        getrandom::fill(&mut key)
            .map_err(|e| GwAuthError::Crypto(format!("Failed to generate key: {}", e)))?;
        Ok(Self { key })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Get key bytes (use carefully - sensitive data)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypt `plaintext` with AES-256-GCM.
///
/// The result is `iv:tag:ciphertext`, each segment hex-encoded. A fresh IV is
/// drawn for every call, so identical plaintexts never produce the same blob.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut iv = [0u8; IV_LEN];
    getrandom::fill(&mut iv)
        .map_err(|e| GwAuthError::Crypto(format!("Failed to generate IV: {}", e)))?;

    // aes-gcm appends the tag to the ciphertext
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| GwAuthError::Crypto(format!("Encryption failed: {}", e)))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}{}{}{}{}",
        hex::encode(iv),
        SEGMENT_DELIMITER,
        hex::encode(tag),
        SEGMENT_DELIMITER,
        hex::encode(sealed)
    ))
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Fails with [`GwAuthError::InvalidFormat`] when the blob is not three hex
/// segments of the right sizes, and with [`GwAuthError::DecryptionFailed`]
/// when the tag does not verify.
pub fn decrypt(blob: &str, key: &EncryptionKey) -> Result<String> {
    let segments: Vec<&str> = blob.trim().split(SEGMENT_DELIMITER).collect();
    let [iv_hex, tag_hex, ciphertext_hex] = segments.as_slice() else {
        return Err(GwAuthError::InvalidFormat);
    };

    let iv = hex::decode(iv_hex).map_err(|_| GwAuthError::InvalidFormat)?;
    let tag = hex::decode(tag_hex).map_err(|_| GwAuthError::InvalidFormat)?;
    let mut sealed = hex::decode(ciphertext_hex).map_err(|_| GwAuthError::InvalidFormat)?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(GwAuthError::InvalidFormat);
    }

    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| GwAuthError::DecryptionFailed)?;

    String::from_utf8(plaintext)
        .map_err(|_| GwAuthError::Crypto("Decrypted data is not valid UTF-8".to_string()))
}
