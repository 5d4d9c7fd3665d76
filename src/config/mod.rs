//! Runtime configuration for the tactum daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DeviceId;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device identity and link settings.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Protocol timing.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if DeviceId::new(self.device.id).is_none() {
            return Err(Error::InvalidConfig(format!(
                "device id {:#04x} below the assignable floor {:#04x}",
                self.device.id,
                DeviceId::FLOOR
            )));
        }
        if self.protocol.tx_timeout.is_zero() {
            return Err(Error::InvalidConfig("tx_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Device identity and link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Assigned serial address.
    #[serde(default = "default_device_id")]
    pub id: u8,

    /// Encrypt payloads and enforce the replay counter.
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,

    /// TCP address standing in for the serial link.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Backing file for the emulated non-volatile storage.
    #[serde(default = "default_storage_file")]
    pub storage_file: PathBuf,
}

fn default_device_id() -> u8 {
    DeviceId::FLOOR
}
fn default_encrypt() -> bool {
    true
}
fn default_listen() -> SocketAddr {
    "127.0.0.1:7654".parse().expect("static address")
}
fn default_storage_file() -> PathBuf {
    PathBuf::from("tactum.nv")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            encrypt: default_encrypt(),
            listen: default_listen(),
            storage_file: default_storage_file(),
        }
    }
}

/// Protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Without a sync exchange for this long, stimulation stops.
    #[serde(default = "default_sync_timeout", with = "humantime_serde")]
    pub sync_timeout: Duration,

    /// In-flight transmissions are aborted after this long.
    #[serde(default = "default_tx_timeout", with = "humantime_serde")]
    pub tx_timeout: Duration,
}

fn default_sync_timeout() -> Duration {
    Duration::from_millis(1000)
}
fn default_tx_timeout() -> Duration {
    Duration::from_millis(50)
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            sync_timeout: default_sync_timeout(),
            tx_timeout: default_tx_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(config.color))
        .try_init()
        .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.id, 0xF0);
        assert!(config.device.encrypt);
        assert_eq!(config.protocol.sync_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_reserved_device_id_rejected() {
        let mut config = Config::default();
        config.device.id = 0x10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.device.id, config.device.id);
        assert_eq!(parsed.protocol.tx_timeout, config.protocol.tx_timeout);
    }
}
