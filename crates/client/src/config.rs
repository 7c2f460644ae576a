//! Consumer configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Bridge socket to connect to (`~` is expanded)
    #[serde(default = "ClientSettings::default_socket_path")]
    pub socket_path: String,
    #[serde(default = "ClientSettings::default_log_level")]
    pub log_level: String,
    /// Give up on a single request after this many seconds
    #[serde(default = "ClientSettings::default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ClientSettings {
    fn default_socket_path() -> String {
        match dirs::runtime_dir() {
            Some(dir) => dir.join("usb-fd-bridge.sock").display().to_string(),
            None => "/tmp/usb-fd-bridge.sock".to_string(),
        }
    }

    fn default_log_level() -> String {
        "warn".to_string()
    }

    fn default_request_timeout() -> u64 {
        30
    }

    /// Socket path with `~` expanded
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.socket_path).as_ref())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings {
                socket_path: ClientSettings::default_socket_path(),
                log_level: ClientSettings::default_log_level(),
                request_timeout_secs: ClientSettings::default_request_timeout(),
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-fd-bridge/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-fd-bridge").join("client.toml")
        } else {
            PathBuf::from(".config/usb-fd-bridge/client.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.client.socket_path.trim().is_empty() {
            return Err(anyhow!("client.socket_path must not be empty"));
        }

        if self.client.request_timeout_secs == 0 {
            return Err(anyhow!("client.request_timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "warn");
        assert_eq!(config.client.request_timeout(), Duration::from_secs(30));
        assert!(config.client.socket_path.ends_with("usb-fd-bridge.sock"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.client.socket_path, parsed.client.socket_path);
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let parsed: ClientConfig = toml::from_str("[client]\nsocket_path = \"/run/bridge.sock\"\n").unwrap();
        assert_eq!(parsed.client.socket_path(), PathBuf::from("/run/bridge.sock"));
        assert_eq!(parsed.client.log_level, "warn");
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usb-fd-bridge").join("client.toml");

        ClientConfig::default().save(&path).unwrap();
        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.client.log_level, "warn");
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        config.client.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.client.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
