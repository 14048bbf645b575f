//! Configuration loading and persistence.
//!
//! Handles reading and writing the portal configuration file.
//! The bearer token is never part of this file; it lives in the
//! token store (see [`crate::keyring`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the portal client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote API (identity endpoints live under `/auth`).
    pub api_base_url: String,
    /// Push endpoint. The token is appended as a query parameter.
    pub push_url: String,
    /// Timeout in seconds for a single HTTP request.
    pub request_timeout_secs: u64,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: constants::DEFAULT_API_BASE_URL.to_string(),
            push_url: constants::DEFAULT_PUSH_URL.to_string(),
            request_timeout_secs: constants::HTTP_REQUEST_TIMEOUT.as_secs(),
            reconnect_initial_ms: duration_ms(constants::RECONNECT_INITIAL_DELAY),
            reconnect_max_ms: duration_ms(constants::RECONNECT_MAX_DELAY),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/hr-portal-test`
    /// 2. `HR_PORTAL_CONFIG_DIR` env var: explicit override
    /// 3. `HR_PORTAL_ENV=test|system_test`: `tmp/hr-portal-test`
    /// 4. Default: platform config dir + `hr-portal`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/hr-portal-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("HR_PORTAL_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_any_test() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/hr-portal-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("hr-portal")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default config: {e}");
            Self::default()
        });
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            anyhow::bail!("Config file not found");
        }
        let content = fs::read_to_string(&config_path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HR_PORTAL_API_URL") {
            self.api_base_url = url;
        }

        if let Ok(url) = std::env::var("HR_PORTAL_WS_URL") {
            self.push_url = url;
        }

        if let Ok(timeout) = std::env::var("HR_PORTAL_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(initial) = std::env::var("HR_PORTAL_RECONNECT_INITIAL_MS") {
            if let Ok(ms) = initial.parse::<u64>() {
                self.reconnect_initial_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("HR_PORTAL_RECONNECT_MAX_MS") {
            if let Ok(ms) = max.parse::<u64>() {
                self.reconnect_max_ms = ms;
            }
        }
    }

    /// Clamp values that would break the retry policy.
    ///
    /// The reconnect delay must never be zero (no tight retry loop) and the
    /// cap must not be below the initial delay.
    pub fn normalize(&mut self) {
        self.reconnect_initial_ms = self.reconnect_initial_ms.max(1);
        self.reconnect_max_ms = self.reconnect_max_ms.max(self.reconnect_initial_ms);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// First reconnect delay.
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Reconnect delay cap.
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://localhost:5000/api");
        assert_eq!(config.push_url, "ws://localhost:5000");
        assert_eq!(config.request_timeout_secs, 10);
        assert_eq!(config.reconnect_initial_ms, 1_000);
        assert_eq!(config.reconnect_max_ms, 30_000);
    }

    #[test]
    fn test_config_serialization_has_no_token() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"push_url": "wss://push.example.com"}"#).unwrap();
        assert_eq!(config.push_url, "wss://push.example.com");
        assert_eq!(config.api_base_url, "http://localhost:5000/api");
    }

    #[test]
    fn test_normalize_clamps_backoff() {
        let mut config = Config {
            reconnect_initial_ms: 0,
            reconnect_max_ms: 0,
            api_base_url: "https://hr.example.com/api/".to_string(),
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.reconnect_initial_ms, 1);
        assert_eq!(config.reconnect_max_ms, 1);
        assert_eq!(config.api_base_url, "https://hr.example.com/api");

        let mut config = Config {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 100,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.reconnect_max_ms, 5_000);
    }
}
