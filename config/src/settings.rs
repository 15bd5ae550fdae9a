//! Application settings management

use crate::error::ConfigError;
use crate::secret::SealedSecret;
use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::fs;

fn default_top_k() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_poll_timeout_secs() -> u64 {
    300
}

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the knowledge assistant backend (e.g., "http://localhost:8000")
    pub base_url: Option<String>,
    /// Bearer token for the backend API, sealed to this machine
    pub api_token: Option<SealedSecret>,
    /// Number of chunks requested per retrieval query
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Seconds between background job status queries
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds after which a background job is considered stuck
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            top_k: default_top_k(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = PathManager::settings_path() else {
            return Self::default();
        };

        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };

        toml::from_str(&content).unwrap_or_default()
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = PathManager::settings_path().ok_or(ConfigError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Get the unsealed API token.
    /// Returns None if not set or it does not open on this machine.
    pub fn get_api_token(&self) -> Option<String> {
        self.api_token.as_ref().and_then(|sealed| sealed.open().ok())
    }

    /// Set the API token (sealed before storing).
    pub fn set_api_token(&mut self, token: &str) -> Result<(), ConfigError> {
        self.api_token = Some(SealedSecret::seal(token)?);
        Ok(())
    }

    /// Remove the stored API token.
    pub fn clear_api_token(&mut self) {
        self.api_token = None;
    }

    pub fn has_api_token(&self) -> bool {
        self.api_token.is_some()
    }
}
