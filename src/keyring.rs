//! Durable storage for the bearer token.
//!
//! The session keeps exactly one token slot: written on login, cleared on
//! logout, read once at startup. Last writer wins.
//!
//! # Storage
//!
//! Production: single OS keyring entry `hr-portal/credentials` containing JSON.
//! Test mode: file at `{config_dir}/credentials.json`.
//!
//! # Graceful Degradation
//!
//! The OS keychain may be locked or deny access (e.g. after the binary
//! signature changes). Those cases are distinguished for logging, but all of
//! them degrade to "no stored token": the user simply logs in again.

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keyring service name.
const KEYRING_SERVICE: &str = "hr-portal";
/// Consolidated keyring entry name.
const KEYRING_CREDENTIALS: &str = "credentials";

/// Single-slot durable token storage.
///
/// Implementations must be cheap to call from the session store; failures
/// are reported but the caller treats the in-memory credential as
/// authoritative.
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Read the stored token, if any.
    fn load(&self) -> Option<String>;

    /// Replace the stored token.
    fn save(&self, token: &str) -> Result<()>;

    /// Remove the stored token. Succeeds when nothing is stored.
    fn clear(&self) -> Result<()>;
}

/// Categorized keyring access errors for better user feedback.
#[derive(Debug)]
pub enum KeyringAccessError {
    /// Keyring is locked and requires user interaction to unlock.
    Locked(String),
    /// Entry does not exist (normal for first run).
    NotFound,
    /// Access denied, likely due to binary signature change.
    AccessDenied(String),
    /// Data exists but is corrupted or unparseable.
    Corrupted(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked(msg) => write!(f, "Keyring locked: {msg}"),
            Self::NotFound => write!(f, "Keyring entry not found"),
            Self::AccessDenied(msg) => write!(f, "Keyring access denied: {msg}"),
            Self::Corrupted(msg) => write!(f, "Keyring data corrupted: {msg}"),
            Self::Other(msg) => write!(f, "Keyring error: {msg}"),
        }
    }
}

impl std::error::Error for KeyringAccessError {}

/// Categorize a keyring error for better user feedback.
fn categorize_keyring_error(err: &keyring::Error) -> KeyringAccessError {
    match err {
        keyring::Error::NoEntry => return KeyringAccessError::NotFound,
        keyring::Error::BadEncoding(_) => {
            return KeyringAccessError::Corrupted(format!("{err:?}"));
        }
        _ => {}
    }

    let msg = format!("{err:?}");
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("user interaction") || msg_lower.contains("user canceled") {
        return KeyringAccessError::Locked(msg);
    }

    if msg_lower.contains("denied")
        || msg_lower.contains("codesign")
        || msg_lower.contains("not allowed")
    {
        return KeyringAccessError::AccessDenied(msg);
    }

    KeyringAccessError::Other(msg)
}

/// Serialized form of the stored slot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, Zeroize, ZeroizeOnDrop)]
struct StoredCredentials {
    /// Bearer token issued by the identity endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,

    /// Schema version for future migrations.
    #[serde(default = "default_version")]
    version: u8,
}

fn default_version() -> u8 {
    1
}

/// Token storage backed by the OS keyring.
///
/// In any test environment (`HR_PORTAL_ENV=test|system_test`, or unit tests)
/// this transparently uses a [`FileTokenStore`] in the config directory.
#[derive(Debug, Default)]
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    /// Create a keyring-backed store.
    pub fn new() -> Self {
        Self
    }

    fn should_skip_keyring() -> bool {
        #[cfg(test)]
        {
            true
        }

        #[cfg(not(test))]
        {
            crate::env::should_skip_keyring()
        }
    }

    fn file_fallback() -> Result<FileTokenStore> {
        let path = crate::config::Config::config_dir()?.join("credentials.json");
        Ok(FileTokenStore::new(path))
    }

    fn entry() -> std::result::Result<Entry, KeyringAccessError> {
        Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
            .map_err(|e| KeyringAccessError::Other(format!("Failed to create entry: {e:?}")))
    }

    fn try_load() -> std::result::Result<Option<String>, KeyringAccessError> {
        let json = Self::entry()?
            .get_password()
            .map_err(|e| categorize_keyring_error(&e))?;
        let creds: StoredCredentials = serde_json::from_str(&json)
            .map_err(|e| KeyringAccessError::Corrupted(format!("JSON parse error: {e}")))?;
        Ok(creds.token.clone())
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Option<String> {
        if Self::should_skip_keyring() {
            return match Self::file_fallback() {
                Ok(store) => store.load(),
                Err(e) => {
                    log::warn!("Token file unavailable: {e}");
                    None
                }
            };
        }

        match Self::try_load() {
            Ok(token) => token,
            Err(KeyringAccessError::NotFound) => {
                log::debug!("No token found in keyring");
                None
            }
            Err(err @ KeyringAccessError::AccessDenied(_)) => {
                log::warn!("{err}");
                log::info!(
                    "Hint: binary signature may have changed. \
                     Unlock your keychain or log in again."
                );
                None
            }
            Err(err) => {
                log::warn!("{err}. Stored session will be ignored.");
                None
            }
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        if Self::should_skip_keyring() {
            return Self::file_fallback()?.save(token);
        }

        let creds = StoredCredentials {
            token: Some(token.to_string()),
            version: default_version(),
        };
        let json = serde_json::to_string(&creds)?;
        Self::entry()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .set_password(&json)
            .map_err(|e| anyhow::anyhow!("Failed to store token in keyring: {e:?}"))?;

        log::info!("Saved session token to OS keyring");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if Self::should_skip_keyring() {
            return Self::file_fallback()?.clear();
        }

        match Self::entry()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .delete_credential()
        {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                log::info!("Deleted session token from OS keyring");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to delete keyring entry: {e:?}")),
        }
    }
}

/// Token storage in a JSON file (0600 on unix).
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store the token at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredCredentials>(&content) {
            Ok(creds) => creds.token.clone(),
            Err(e) => {
                log::warn!(
                    "Token file {} corrupted, ignoring: {e}",
                    self.path.display()
                );
                None
            }
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let creds = StoredCredentials {
            token: Some(token.to_string()),
            version: default_version(),
        };
        let json = serde_json::to_string_pretty(&creds)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        log::debug!("Saved session token to file");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Process-local token storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `token`, as if left over from a previous run.
    pub fn with_token(token: &str) -> Self {
        Self {
            slot: Mutex::new(Some(token.to_string())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| anyhow::anyhow!("token slot poisoned: {e}"))?;
        *slot = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| anyhow::anyhow!("token slot poisoned: {e}"))?;
        if let Some(mut old) = slot.take() {
            old.zeroize();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_credentials_skip_none_token() {
        let creds = StoredCredentials::default();
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("token"));
        assert!(json.contains("version"));
    }

    #[test]
    fn test_file_store_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested/credentials.json"));

        assert_eq!(store.load(), None);
        store.save("tok_first").unwrap();
        store.save("tok_second").unwrap();
        assert_eq!(store.load().as_deref(), Some("tok_second"));

        store.clear().unwrap();
        assert_eq!(store.load(), None);
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("credentials.json"));
        store.save("tok").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_corrupted_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(FileTokenStore::new(path).load(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::with_token("tok_seed");
        assert_eq!(store.load().as_deref(), Some("tok_seed"));
        store.save("tok_new").unwrap();
        assert_eq!(store.load().as_deref(), Some("tok_new"));
        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_keyring_access_error_display() {
        let locked = KeyringAccessError::Locked("user canceled".to_string());
        assert!(locked.to_string().contains("Keyring locked"));

        let not_found = KeyringAccessError::NotFound;
        assert!(not_found.to_string().contains("not found"));

        let denied = KeyringAccessError::AccessDenied("codesign".to_string());
        assert!(denied.to_string().contains("access denied"));

        let corrupted = KeyringAccessError::Corrupted("invalid json".to_string());
        assert!(corrupted.to_string().contains("corrupted"));
    }

    #[test]
    fn test_categorize_no_entry() {
        assert!(matches!(
            categorize_keyring_error(&keyring::Error::NoEntry),
            KeyringAccessError::NotFound
        ));
    }
}
