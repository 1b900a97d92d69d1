use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Number of connection attempts before the establisher gives up
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Errors that can occur during config operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,
}

/// Connection establishment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSettings {
    /// Attempts before reporting failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// TCP/TLS connect timeout applied to the client profile
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read/write timeout applied to the client profile
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Overall deadline for one attempt (resolve, sign, build, version check)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    MAX_CONNECT_ATTEMPTS
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_attempt_timeout() -> u64 {
    30
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            attempt_timeout_secs: 30,
        }
    }
}

impl ConnectSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Port-forward tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Default local bind address for new tunnels
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Lowest port tried when picking a random local port
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Highest port tried when picking a random local port
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Random ports probed before falling back to an OS-assigned one
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// Deadline for resolving the target and binding the listener
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port_range_start() -> u16 {
    10000
}

fn default_port_range_end() -> u16 {
    65000
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_start_timeout() -> u64 {
    15
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port_range_start: 10000,
            port_range_end: 65000,
            probe_attempts: 10,
            start_timeout_secs: 15,
        }
    }
}

impl TunnelSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Explicit kubeconfig path, checked before `KUBECONFIG` and `~/.kube/config`
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Connection establishment
    #[serde(default)]
    pub connect: ConnectSettings,

    /// Port-forward tunnels
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl AppConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("kubelink");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }

        Ok(config_dir)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, falling back to defaults if it is missing
    pub fn load_from(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &PathBuf) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Reset to defaults and save
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        *self = Self::default();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.connect.max_attempts, MAX_CONNECT_ATTEMPTS);
        assert_eq!(config.connect.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tunnel.bind_address, "0.0.0.0");
        assert_eq!(config.tunnel.port_range_start, 10000);
        assert_eq!(config.tunnel.port_range_end, 65000);
        assert_eq!(config.tunnel.probe_attempts, 10);
        assert!(config.kubeconfig.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{ "connect": { "max_attempts": 5 }, "tunnel": { "bind_address": "127.0.0.1" } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.connect.max_attempts, 5);
        assert_eq!(config.connect.read_timeout_secs, 30);
        assert_eq!(config.tunnel.bind_address, "127.0.0.1");
        assert_eq!(config.tunnel.probe_attempts, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.kubeconfig = Some(PathBuf::from("/tmp/kubeconfig"));
        config.tunnel.start_timeout_secs = 3;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        assert_eq!(loaded.tunnel.start_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.connect.max_attempts, MAX_CONNECT_ATTEMPTS);
    }
}
