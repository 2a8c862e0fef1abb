//! # Device Secret Encryption
//!
//! Device communication keys are stored encrypted with AES-256-GCM.
//!
//! ## Stored Format
//! ```text
//! "v1:" + hex( nonce[12] || ciphertext || tag[16] )
//! ```
//!
//! ## Key Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  worker start ──► install_process_key(key)                              │
//! │                        │                                                │
//! │                        ▼                                                │
//! │                 process_cipher() ──► SecretCipher (shared by services) │
//! │                        │                                                │
//! │  worker stop  ──► clear_process_key()                                   │
//! │                                                                         │
//! │  Without a key, decrypt() returns its input unchanged and logs a       │
//! │  warning. Services can also be handed their own SecretCipher.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Prefix of every ciphertext this module produces.
pub const CIPHERTEXT_PREFIX: &str = "v1:";

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("No secret encryption key installed")]
    NoKey,

    #[error("Invalid secret key: {0}")]
    InvalidKey(String),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Secret decryption failed (wrong key or tampered data)")]
    DecryptFailed,

    #[error("Secret encryption failed")]
    EncryptFailed,

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// 256-bit key for secrets at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SecretKey(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        SecretKey(bytes)
    }

    /// Parses 64 hex characters.
    pub fn from_hex(text: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(text.trim()).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SecretError::InvalidKey(format!("expected {KEY_LEN} bytes")))?;
        Ok(SecretKey(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Reads a hex key file.
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    /// Writes the key as hex, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), SecretError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_owner_only(path, self.to_hex().as_bytes())?;
        Ok(())
    }
}

/// Writes `contents` to a file created with owner-only permissions.
///
/// A file that already exists is truncated and narrowed to 0600 before
/// anything is written to it.
#[cfg(unix)]
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

// =============================================================================
// Cipher
// =============================================================================

/// Encrypts and decrypts device secrets.
///
/// Cheap to clone. A cipher built with [`SecretCipher::disabled`] has no key.
#[derive(Clone, Default)]
pub struct SecretCipher {
    cipher: Option<Arc<Aes256Gcm>>,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("has_key", &self.has_key())
            .finish()
    }
}

impl SecretCipher {
    pub fn new(key: &SecretKey) -> Self {
        SecretCipher {
            cipher: Some(Arc::new(Aes256Gcm::new((&key.0).into()))),
        }
    }

    pub fn disabled() -> Self {
        SecretCipher { cipher: None }
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypts with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = self.cipher.as_ref().ok_or(SecretError::NoKey)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{CIPHERTEXT_PREFIX}{}", hex::encode(blob)))
    }

    /// Decrypts a stored secret.
    ///
    /// Without a key the input comes back unchanged (with a warning).
    pub fn decrypt(&self, stored: &str) -> Result<String, SecretError> {
        let Some(cipher) = self.cipher.as_ref() else {
            warn!("Decrypting device secret without a key; returning stored value unchanged");
            return Ok(stored.to_string());
        };

        let encoded = stored
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| SecretError::Malformed("missing version prefix".into()))?;
        let blob = hex::decode(encoded).map_err(|e| SecretError::Malformed(e.to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(SecretError::Malformed("too short".into()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptFailed)
    }
}

// =============================================================================
// Process-wide key
// =============================================================================

static PROCESS_CIPHER: RwLock<Option<SecretCipher>> = RwLock::new(None);

/// Installs the key used by [`process_cipher`].
pub fn install_process_key(key: &SecretKey) {
    let mut slot = PROCESS_CIPHER.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(SecretCipher::new(key));
    info!("Process secret key installed");
}

/// Removes the process key. Later decrypts fail soft.
pub fn clear_process_key() {
    let mut slot = PROCESS_CIPHER.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

/// The installed cipher, or a keyless one.
pub fn process_cipher() -> SecretCipher {
    PROCESS_CIPHER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_default()
}
