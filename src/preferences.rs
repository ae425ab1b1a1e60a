//! Persisted consent and usage preferences.
//!
//! An owned, explicitly loaded and saved value. Callers hold a
//! `Preferences` for as long as they need it and pass it by reference;
//! nothing here is process-global.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::usage::UsageInfo;

const PREFERENCES_FILE: &str = "preferences.json";

/// User preferences persisted between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Preferences {
    /// Whether the user accepted the streaming terms.
    pub consent_accepted: bool,
    /// When consent was last accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_accepted_at: Option<DateTime<Utc>>,
    /// Most recent quota snapshot reported by the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<UsageInfo>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Preferences {
    /// Load preferences from the config directory.
    pub fn load() -> Result<Self> {
        let dir = crate::config::Config::config_dir()?;
        Self::load_from(&dir.join(PREFERENCES_FILE))
    }

    /// Load preferences from an explicit file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut prefs = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Self>(&content)
                .with_context(|| format!("invalid preferences at {}", path.display()))?
        } else {
            Self::default()
        };
        prefs.path = Some(path.to_path_buf());
        Ok(prefs)
    }

    /// Write preferences back to the file they were loaded from.
    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => crate::config::Config::config_dir()?.join(PREFERENCES_FILE),
        };
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Record acceptance of the streaming terms.
    pub fn accept_consent(&mut self) {
        self.consent_accepted = true;
        self.consent_accepted_at = Some(Utc::now());
    }

    /// Withdraw consent. Streaming commands refuse to run afterwards.
    pub fn revoke_consent(&mut self) {
        self.consent_accepted = false;
        self.consent_accepted_at = None;
    }

    /// Remember the latest quota snapshot.
    pub fn record_usage(&mut self, usage: UsageInfo) {
        self.last_usage = Some(usage);
    }
}
