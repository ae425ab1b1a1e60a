//! API key storage.
//!
//! ```text
//! Credentials ──▶ Store::Keyring  OS keychain entry "stylestream"/"credentials" (JSON body)
//!            └──▶ Store::File     {config_dir}/credentials.json, mode 0600
//! ```
//!
//! The file store is used in test mode and when `STYLESTREAM_NO_KEYRING` is
//! set. A keychain that refuses access (locked, or the binary signature
//! changed) is retried once; after that the key reads as missing and the
//! session reports "No API key configured" instead of aborting startup.

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

const SERVICE: &str = "stylestream";
const ENTRY: &str = "credentials";
const FILE_NAME: &str = "credentials.json";

const LOAD_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Why the keychain could not be read.
#[derive(Debug)]
pub enum KeyringAccessError {
    /// Locked; unlocking needs user interaction.
    Locked(String),
    /// Nothing stored yet.
    NotFound,
    /// Refused, typically after the binary was re-signed.
    AccessDenied(String),
    /// Stored value is not valid credentials JSON.
    Corrupted(String),
    /// Anything else the platform reports.
    Other(String),
}

impl KeyringAccessError {
    /// Worth another attempt.
    fn is_transient(&self) -> bool {
        matches!(self, Self::Locked(_) | Self::AccessDenied(_) | Self::Other(_))
    }
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

impl From<keyring::Error> for KeyringAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => Self::NotFound,
            keyring::Error::NoStorageAccess(e) => {
                let msg = e.to_string();
                if msg.to_lowercase().contains("user interaction") {
                    Self::Locked(msg)
                } else {
                    Self::AccessDenied(msg)
                }
            }
            keyring::Error::BadEncoding(_) => Self::Corrupted("entry is not valid UTF-8".to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Backing store, chosen once per call from the environment.
enum Store {
    Keyring,
    File(PathBuf),
}

impl Store {
    fn select() -> Result<Self> {
        if crate::env::should_skip_keyring() {
            let dir = crate::config::Config::config_dir()?;
            Ok(Self::File(dir.join(FILE_NAME)))
        } else {
            Ok(Self::Keyring)
        }
    }

    fn entry() -> std::result::Result<Entry, KeyringAccessError> {
        Entry::new(SERVICE, ENTRY).map_err(KeyringAccessError::from)
    }

    fn read_keyring() -> std::result::Result<Credentials, KeyringAccessError> {
        let json = Self::entry()?.get_password()?;
        serde_json::from_str(&json).map_err(|e| KeyringAccessError::Corrupted(e.to_string()))
    }
}

/// Stored credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Key presented in the `auth` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Credentials {
    /// Load from the active store. A missing or unreadable keychain entry
    /// yields empty credentials.
    pub fn load() -> Result<Self> {
        match Store::select()? {
            Store::File(path) => {
                if !path.exists() {
                    return Ok(Self::default());
                }
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("invalid credentials at {}", path.display()))
            }
            Store::Keyring => Ok(Self::load_keyring()),
        }
    }

    fn load_keyring() -> Self {
        for attempt in 1..=LOAD_ATTEMPTS {
            match Store::read_keyring() {
                Ok(creds) => {
                    log::debug!("Loaded credentials from keyring");
                    return creds;
                }
                Err(KeyringAccessError::NotFound) => return Self::default(),
                Err(err) if err.is_transient() && attempt < LOAD_ATTEMPTS => {
                    log::debug!("Keyring attempt {attempt} failed: {err}");
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(err) => {
                    log::warn!("{err}; the API key may need to be entered again");
                    return Self::default();
                }
            }
        }
        Self::default()
    }

    /// Persist to the active store.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        match Store::select()? {
            Store::File(path) => {
                fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
                #[cfg(unix)]
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
                log::debug!("Saved credentials to {}", path.display());
            }
            Store::Keyring => {
                Store::entry()
                    .and_then(|entry| entry.set_password(&json).map_err(KeyringAccessError::from))
                    .context("failed to store credentials in keyring")?;
                log::info!("Saved credentials to OS keyring");
            }
        }
        Ok(())
    }

    /// Remove whatever the active store holds. Deleting nothing succeeds.
    pub fn delete() -> Result<()> {
        match Store::select()? {
            Store::File(path) => {
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
            Store::Keyring => {
                let entry = Store::entry().context("failed to open keyring entry")?;
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {
                        log::info!("Deleted credentials from OS keyring");
                    }
                    Err(e) => anyhow::bail!("failed to delete credentials: {e}"),
                }
            }
        }
        Ok(())
    }

    /// The API key, if set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Replace the API key.
    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }
}
