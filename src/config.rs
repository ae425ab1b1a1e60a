//! Configuration loading and persistence.
//!
//! Handles reading and writing the stylestream configuration file.
//! The API key is stored in the OS keyring via the keyring module.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf, time::Duration};

use crate::constants::{
    CLOSE_GRACE, CONNECT_TIMEOUT, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH, USAGE_WARN_PERCENT,
};
use crate::frame::FrameRate;
use crate::keyring::Credentials;
use crate::session::SessionConfig;
use crate::transport::TransportKind;

/// Configuration for the stylestream client.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Streaming endpoint (`ws://`, `wss://`, `http://` or `https://`).
    pub server_url: String,
    /// API key - NOT serialized to disk (stored in keyring).
    #[serde(skip)]
    pub api_key: String,
    /// Transport variant used for the session.
    pub transport: TransportKind,
    /// Capture width sent to the service.
    pub input_width: u32,
    /// Capture height sent to the service.
    pub input_height: u32,
    /// Target send rate.
    pub frame_rate: FrameRate,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whether the service should enhance prompts by default.
    pub enhance_prompt: bool,
    /// Prompt applied on authenticate when none is given.
    pub default_prompt: String,
    /// STUN/TURN URLs for the WebRTC transport.
    pub ice_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "wss://api.stylestream.dev/v1/stream".to_string(),
            api_key: String::new(),
            transport: TransportKind::WebSocket,
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
            frame_rate: FrameRate::default(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            enhance_prompt: true,
            default_prompt: String::new(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `STYLESTREAM_CONFIG_DIR` env var: explicit override
    /// 2. `STYLESTREAM_ENV=test`: `{tmp}/stylestream-test`
    /// 3. Default: platform config dir (macOS: ~/Library/Application Support/stylestream)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("STYLESTREAM_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            std::env::temp_dir().join("stylestream-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("stylestream")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    /// The API key comes from the environment or the keyring.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Using default config: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();

        if config.api_key.is_empty() {
            match Credentials::load() {
                Ok(creds) => {
                    if let Some(key) = creds.api_key() {
                        config.api_key = key.to_string();
                    }
                }
                Err(e) => log::warn!("Failed to load credentials: {e:#}"),
            }
        }

        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)
                .with_context(|| format!("invalid config at {}", config_path.display()))?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("STYLESTREAM_SERVER_URL") {
            self.server_url = server_url;
        }

        // API key from env var (for CI/CD)
        if let Ok(key) = std::env::var("STYLESTREAM_API_KEY") {
            self.api_key = key;
        }

        if let Ok(transport) = std::env::var("STYLESTREAM_TRANSPORT") {
            match transport.parse::<TransportKind>() {
                Ok(kind) => self.transport = kind,
                Err(e) => log::warn!("Ignoring STYLESTREAM_TRANSPORT: {e}"),
            }
        }

        if let Ok(fps) = std::env::var("STYLESTREAM_FPS") {
            if let Ok(fps) = fps.parse::<u32>() {
                if fps > 0 {
                    self.frame_rate.numerator = fps;
                    self.frame_rate.denominator = 1;
                }
            }
        }

        if let Ok(timeout) = std::env::var("STYLESTREAM_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.connect_timeout_secs = secs;
            }
        }
    }

    /// Persists the current configuration to disk.
    /// Note: the API key is NOT saved here (use `save_api_key` for that).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Get the API key for authentication.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Save a new API key to the keyring.
    pub fn save_api_key(&mut self, key: &str) -> Result<()> {
        self.api_key = key.to_string();

        let mut creds = Credentials::load().unwrap_or_default();
        creds.set_api_key(key.to_string());
        creds.save()
    }

    /// Forget the API key.
    pub fn clear_api_key(&mut self) -> Result<()> {
        self.api_key.clear();
        Credentials::delete()
    }

    /// Streaming endpoint with `http(s)` converted to `ws(s)`.
    pub fn endpoint(&self) -> String {
        crate::ws::http_to_ws_scheme(&self.server_url)
    }

    /// Project the negotiated-parameter defaults for a new session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            input_width: self.input_width,
            input_height: self.input_height,
            frame_rate: self.frame_rate,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            close_grace: CLOSE_GRACE,
            usage_warn_percent: USAGE_WARN_PERCENT,
        }
    }
}
