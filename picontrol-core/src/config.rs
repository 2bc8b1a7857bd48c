//! Configuration management for picontrol
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/picontrol/
//! - macOS: ~/Library/Application Support/picontrol/
//! - Windows: %APPDATA%\picontrol\
//!
//! `PICONTROL_CONFIG` points at an explicit file instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "PICONTROL_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pocketbase: PocketBaseConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Data store (PocketBase) location and collection names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PocketBaseConfig {
    #[serde(default = "default_pocketbase_url")]
    pub url: String,

    #[serde(default = "default_users_collection")]
    pub users_collection: String,

    #[serde(default = "default_devices_collection")]
    pub devices_collection: String,
}

/// Auth cookie settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Emit the `Secure` cookie attribute (off for plain-HTTP LAN deployments)
    #[serde(default)]
    pub secure: bool,
}

/// Device-local services reached through the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_helper_port")]
    pub helper_port: u16,

    #[serde(default = "default_firmware_port")]
    pub firmware_port: u16,

    #[serde(default = "default_scanner_host")]
    pub scanner_host: String,

    #[serde(default = "default_scanner_port")]
    pub scanner_port: u16,

    /// Liveness/status polling bound
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,

    /// Generic proxy bound (sensors, helper endpoints)
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_ms: u64,

    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_HTTP_PORT
}
fn default_pocketbase_url() -> String {
    format!("http://127.0.0.1:{}", crate::DEFAULT_POCKETBASE_PORT)
}
fn default_users_collection() -> String {
    "users".to_string()
}
fn default_devices_collection() -> String {
    "devices".to_string()
}
fn default_cookie_name() -> String {
    crate::AUTH_COOKIE.to_string()
}
fn default_helper_port() -> u16 {
    crate::DEFAULT_HELPER_PORT
}
fn default_firmware_port() -> u16 {
    crate::DEFAULT_FIRMWARE_PORT
}
fn default_scanner_host() -> String {
    "127.0.0.1".to_string()
}
fn default_scanner_port() -> u16 {
    crate::DEFAULT_SCANNER_PORT
}
fn default_status_timeout() -> u64 {
    3_000
}
fn default_proxy_timeout() -> u64 {
    10_000
}
fn default_scan_timeout() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for PocketBaseConfig {
    fn default() -> Self {
        Self {
            url: default_pocketbase_url(),
            users_collection: default_users_collection(),
            devices_collection: default_devices_collection(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            secure: false,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            helper_port: default_helper_port(),
            firmware_port: default_firmware_port(),
            scanner_host: default_scanner_host(),
            scanner_port: default_scanner_port(),
            status_timeout_ms: default_status_timeout(),
            proxy_timeout_ms: default_proxy_timeout(),
            scan_timeout_ms: default_scan_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("picontrol"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path, honoring `PICONTROL_CONFIG`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, crate::DEFAULT_HTTP_PORT);
        assert_eq!(config.pocketbase.url, "http://127.0.0.1:8090");
        assert_eq!(config.session.cookie_name, "pb_auth");
        assert!(!config.session.secure);
        assert_eq!(config.upstream.status_timeout(), Duration::from_secs(3));
        assert_eq!(config.upstream.firmware_port, 8321);
        assert_eq!(config.upstream.helper_port, 8220);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            status_timeout_ms = 500

            [session]
            secure = true
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.status_timeout_ms, 500);
        assert_eq!(config.upstream.proxy_timeout_ms, 10_000);
        assert!(config.session.secure);
        assert_eq!(config.session.cookie_name, "pb_auth");
        assert_eq!(config.pocketbase.devices_collection, "devices");
    }

    #[test]
    fn test_save_and_load_from() {
        let path = std::env::temp_dir()
            .join(format!("picontrol-config-{}", uuid::Uuid::new_v4()))
            .join("config.toml");

        let mut config = Config::default();
        config.server.port = 9000;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, 9000);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
