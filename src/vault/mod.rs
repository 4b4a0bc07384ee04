//! Credential vault: a single symmetric master key plus authenticated
//! encryption for credential values.
//!
//! Values are encrypted with AES-256-GCM under a key owned exclusively by
//! this process (see [`master_key`] for the keychain/file lifecycle). The
//! stored blob is `base64(version ‖ nonce ‖ ciphertext)` with a 1-byte
//! key-version prefix reserved for future rotation. Decryption failures are
//! deliberately opaque: they never reveal whether the key, nonce, or
//! ciphertext was at fault.

mod master_key;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;

use master_key::{KEY_LEN, load_or_create_key};

/// AES-GCM nonce length in bytes (96 bits).
const NONCE_LEN: usize = 12;

/// Current key version written as the blob prefix byte.
const KEY_VERSION: u8 = 1;

/// Vault errors. Crypto failures carry no detail about key state.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("credential value cannot be decrypted")]
    Decrypt,

    #[error("credential value cannot be encrypted")]
    Encrypt,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<VaultError> for crate::AutomatorError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Decrypt | VaultError::Encrypt => {
                crate::AutomatorError::CredentialUnavailable(e.to_string())
            }
            other => crate::AutomatorError::Internal(other.to_string()),
        }
    }
}

/// Owns the master key and performs AEAD encrypt/decrypt on demand.
///
/// The key is loaded lazily on first use and cached; [`Vault::clear_key`]
/// drops the cached copy (test teardown), after which the next operation
/// re-loads from the keychain or fallback file.
pub struct Vault {
    data_dir: PathBuf,
    use_keychain: bool,
    key: Mutex<Option<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("data_dir", &self.data_dir)
            .field("use_keychain", &self.use_keychain)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Create a vault using the OS keychain with a file fallback in
    /// `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            use_keychain: true,
            key: Mutex::new(None),
        }
    }

    /// Create a vault that only ever uses the fallback key file.
    ///
    /// Used by tests and headless deployments where the platform keychain
    /// should not be touched.
    #[must_use]
    pub fn file_only(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            use_keychain: false,
            key: Mutex::new(None),
        }
    }

    fn key(&self) -> Result<[u8; KEY_LEN], VaultError> {
        let mut guard = self
            .key
            .lock()
            .map_err(|e| VaultError::KeyUnavailable(format!("lock poisoned: {e}")))?;
        if let Some(key) = *guard {
            return Ok(key);
        }
        let (key, source) = load_or_create_key(&self.data_dir, self.use_keychain)?;
        tracing::debug!(source = ?source, "master key loaded");
        *guard = Some(key);
        Ok(key)
    }

    /// Encrypt a plaintext into a stored blob. A fresh random nonce is used
    /// per call, so the same plaintext yields distinct blobs.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let key = self.key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(KEY_VERSION);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored blob. Fails on tampering, truncation, an unknown
    /// key version, or the wrong key — always with the same opaque error.
    pub fn decrypt(&self, blob: &str) -> Result<String, VaultError> {
        let key = self.key()?;
        let bytes = BASE64.decode(blob.trim()).map_err(|_| VaultError::Decrypt)?;
        if bytes.len() < 1 + NONCE_LEN {
            return Err(VaultError::Decrypt);
        }
        if bytes[0] != KEY_VERSION {
            return Err(VaultError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = bytes[1..].split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt)
    }

    /// Zeroise the cached in-memory key. The next operation re-loads it
    /// from the keychain or fallback file.
    pub fn clear_key(&self) {
        if let Ok(mut guard) = self.key.lock()
            && let Some(mut key) = guard.take()
        {
            key.fill(0);
        }
    }
}
