//! Master-key lifecycle for the credential vault.
//!
//! The 32-byte symmetric key lives in the OS keychain under a well-known
//! service/account pair. When the keychain is unavailable (headless
//! machines, stripped-down desktops) the key falls back to a base64-encoded
//! file in the data directory with 0600 permissions. When both sources
//! exist the keychain wins; the file is left in place so the key stays
//! recoverable.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;

use super::VaultError;

/// Keychain service name for the master key.
const SERVICE_NAME: &str = "personal-automator";

/// Keychain account name for the master key.
const ACCOUNT_NAME: &str = "master-key";

/// Master key length in bytes (AES-256).
pub(crate) const KEY_LEN: usize = 32;

/// Filename of the fallback key file within the data directory.
pub(crate) const KEY_FILENAME: &str = "master.key";

/// Where a loaded key came from (logged, never the key itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeySource {
    Keychain,
    File,
    Generated,
}

/// Loads the master key, creating and persisting one on first use.
///
/// `use_keychain = false` restricts the search to the fallback file
/// (used by tests so they never touch the OS keychain).
pub(crate) fn load_or_create_key(
    data_dir: &Path,
    use_keychain: bool,
) -> Result<([u8; KEY_LEN], KeySource), VaultError> {
    if use_keychain
        && let Some(key) = read_keychain_key()?
    {
        return Ok((key, KeySource::Keychain));
    }

    let key_path = key_file_path(data_dir);
    if let Some(key) = read_key_file(&key_path)? {
        return Ok((key, KeySource::File));
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    if use_keychain && write_keychain_key(&key) {
        return Ok((key, KeySource::Generated));
    }

    write_key_file(&key_path, &key)?;
    Ok((key, KeySource::Generated))
}

pub(crate) fn key_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KEY_FILENAME)
}

fn read_keychain_key() -> Result<Option<[u8; KEY_LEN]>, VaultError> {
    let entry = match keyring::Entry::new(SERVICE_NAME, ACCOUNT_NAME) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::debug!(error = %e, "keychain entry unavailable");
            return Ok(None);
        }
    };
    match entry.get_password() {
        Ok(encoded) => decode_key(&encoded).map(Some),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => {
            tracing::debug!(error = %e, "keychain read failed, trying file fallback");
            Ok(None)
        }
    }
}

/// Best-effort keychain write; returns `false` so callers fall back to the
/// key file when the platform store is unusable.
fn write_keychain_key(key: &[u8; KEY_LEN]) -> bool {
    let Ok(entry) = keyring::Entry::new(SERVICE_NAME, ACCOUNT_NAME) else {
        return false;
    };
    match entry.set_password(&BASE64.encode(key)) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "keychain write failed, using file fallback");
            false
        }
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], VaultError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| VaultError::KeyUnavailable(format!("master key is not base64: {e}")))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        VaultError::KeyUnavailable(format!(
            "master key has wrong length ({} bytes)",
            bytes.len()
        ))
    })
}

fn read_key_file(path: &Path) -> Result<Option<[u8; KEY_LEN]>, VaultError> {
    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(VaultError::KeyUnavailable(
            "master key path cannot be a symlink".to_owned(),
        ));
    }

    let mut options = std::fs::OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOFOLLOW);
    }
    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VaultError::Io(e.to_string())),
    };

    let mut encoded = String::new();
    file.read_to_string(&mut encoded)
        .map_err(|e| VaultError::Io(e.to_string()))?;
    decode_key(&encoded).map(Some)
}

fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VaultError::Io(e.to_string()))?;
    }
    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(VaultError::KeyUnavailable(
            "master key path cannot be a symlink".to_owned(),
        ));
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600).custom_flags(libc::O_NOFOLLOW);
    }
    let mut file = options
        .open(path)
        .map_err(|e| VaultError::Io(format!("cannot create key file: {e}")))?;
    file.write_all(BASE64.encode(key).as_bytes())
        .map_err(|e| VaultError::Io(e.to_string()))?;
    file.sync_all().map_err(|e| VaultError::Io(e.to_string()))?;

    tracing::info!(path = %path.display(), "master key written to fallback file");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn generates_and_reloads_file_key() {
        let dir = tempfile::tempdir().unwrap();

        let (key, source) = load_or_create_key(dir.path(), false).unwrap();
        assert_eq!(source, KeySource::Generated);

        let (reloaded, source) = load_or_create_key(dir.path(), false).unwrap();
        assert_eq!(source, KeySource::File);
        assert_eq!(key, reloaded);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        load_or_create_key(dir.path(), false).unwrap();

        let meta = std::fs::metadata(key_file_path(dir.path())).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(key_file_path(dir.path()), "not base64 at all!!").unwrap();

        let err = load_or_create_key(dir.path(), false).unwrap_err();
        assert!(matches!(err, VaultError::KeyUnavailable(_)));
    }

    #[test]
    fn truncated_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(key_file_path(dir.path()), BASE64.encode([7u8; 16])).unwrap();

        let err = load_or_create_key(dir.path(), false).unwrap_err();
        assert!(matches!(err, VaultError::KeyUnavailable(_)));
    }

    // Integration test for the real keychain — requires platform credential
    // store access, run manually.
    #[test]
    #[ignore]
    fn keychain_round_trip_integration() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = load_or_create_key(dir.path(), true).unwrap();
        let (reloaded, source) = load_or_create_key(dir.path(), true).unwrap();
        assert_eq!(source, KeySource::Keychain);
        assert_eq!(key, reloaded);
    }
}
