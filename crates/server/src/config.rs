//! Bridge daemon configuration management

use crate::session::DEFAULT_OPEN_TIMEOUT;
use crate::usb::{DeviceFilter, DupStrategyKind, FilterPattern};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Descriptor hand-off tuning
    #[serde(default)]
    pub handoff: HandoffSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Unix socket consumers connect to (`~` is expanded)
    #[serde(default = "ServerSettings::default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub service_mode: bool,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl ServerSettings {
    fn default_socket_path() -> String {
        match dirs::runtime_dir() {
            Some(dir) => dir.join("usb-fd-bridge.sock").display().to_string(),
            None => "/tmp/usb-fd-bridge.sock".to_string(),
        }
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Socket path with `~` expanded
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.socket_path).as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns (empty = all devices)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Only expose devices with a CDC-ACM interface
    #[serde(default)]
    pub cdc_acm_only: bool,
    /// Hide Linux root hubs
    #[serde(default = "UsbSettings::default_skip_root_hubs")]
    pub skip_root_hubs: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            cdc_acm_only: false,
            skip_root_hubs: Self::default_skip_root_hubs(),
        }
    }
}

impl UsbSettings {
    fn default_skip_root_hubs() -> bool {
        true
    }

    /// Build the runtime filter
    pub fn device_filter(&self) -> Result<DeviceFilter> {
        DeviceFilter::new(&self.filters, self.cdc_acm_only, self.skip_root_hubs)
            .map_err(|e| anyhow!(e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffSettings {
    /// "auto", "cloexec" or "legacy"
    #[serde(default)]
    pub dup_strategy: DupStrategyKind,
    /// Bound on one OS open (e.g. "10s", "1m30s")
    #[serde(default = "HandoffSettings::default_open_timeout", with = "duration_serde")]
    pub open_timeout: Duration,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            dup_strategy: DupStrategyKind::default(),
            open_timeout: Self::default_open_timeout(),
        }
    }
}

impl HandoffSettings {
    fn default_open_timeout() -> Duration {
        DEFAULT_OPEN_TIMEOUT
    }
}

/// Serde helpers for human-readable durations
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "10s", "500ms", "1m30s"
    ///
    /// A bare number is taken as seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }

            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1_000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = total_ms.saturating_add(num.saturating_mul(unit_ms));
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = total_ms.saturating_add(num.saturating_mul(1_000));
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis() as u64;
        let hours = total_ms / 3_600_000;
        let mins = (total_ms % 3_600_000) / 60_000;
        let secs = (total_ms % 60_000) / 1_000;
        let millis = total_ms % 1_000;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 {
            result.push_str(&format!("{}s", secs));
        }
        if millis > 0 || result.is_empty() {
            result.push_str(&format!("{}ms", millis));
        }
        result
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                socket_path: ServerSettings::default_socket_path(),
                service_mode: false,
                log_level: ServerSettings::default_log_level(),
            },
            usb: UsbSettings::default(),
            handoff: HandoffSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-fd-bridge/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usb-fd-bridge").join("server.toml")
        } else {
            PathBuf::from(".config/usb-fd-bridge/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.server.socket_path.trim().is_empty() {
            return Err(anyhow!("server.socket_path must not be empty"));
        }

        for filter in &self.usb.filters {
            FilterPattern::parse(filter).map_err(|e| anyhow!(e))?;
        }

        if self.handoff.open_timeout.is_zero() {
            return Err(anyhow!("handoff.open_timeout must be greater than 0"));
        }

        Ok(())
    }
}

/// Load a config file given a user-supplied path (`~` is expanded)
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ServerConfig::load(Some(path_buf))
}
