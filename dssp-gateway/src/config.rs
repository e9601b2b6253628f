use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Serial device of the gateway, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    /// How long the transmit loop waits for an ack before retransmitting
    pub response_timeout_ms: u64,
    /// Retransmissions after the first attempt
    pub retries: u32,
    /// Overall deadline for a blocking client request
    pub request_timeout_ms: u64,
    /// Node id used by this host, e.g. as heartbeat producer
    pub local_node_id: u8,
    /// Response timeout used while scanning for nodes
    pub scan_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            response_timeout_ms: 3_000,
            retries: 2,
            request_timeout_ms: 10_000,
            local_node_id: 127,
            scan_timeout_ms: 1,
        }
    }
}

impl GatewayConfig {
    /// Get the path to the config file
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "dssp", "dssp-gateway")
            .map(|proj_dirs| {
                let config_dir = proj_dirs.config_dir();
                config_dir.join("config.toml")
            })
    }

    /// Load configuration from file, returns default if file doesn't exist or on error
    pub fn load() -> Self {
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                match Self::from_file(&config_path) {
                    Ok(config) => {
                        info!("Loaded configuration from {:?}", config_path);
                        return config;
                    }
                    Err(e) => {
                        warn!("Ignoring config file {:?}: {}", config_path, e);
                    }
                }
            }
        }

        info!("Using default configuration");
        Self::default()
    }

    /// Read and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the per-user config file
    pub fn save(&self) -> Result<(), GatewayError> {
        let config_path = Self::config_file_path()
            .ok_or_else(|| GatewayError::Config("Could not determine config file path".to_string()))?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), GatewayError> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        fs::write(path, toml_string)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.baud_rate == 0 {
            return Err(GatewayError::Config("Baud rate must be greater than zero".to_string()));
        }
        if self.response_timeout_ms == 0 {
            return Err(GatewayError::Config("Response timeout must be greater than zero".to_string()));
        }
        if self.request_timeout_ms < self.response_timeout_ms {
            return Err(GatewayError::Config(
                "Request timeout must not be shorter than the response timeout".to_string(),
            ));
        }
        if !(1..=127).contains(&self.local_node_id) {
            return Err(GatewayError::InvalidNode(self.local_node_id));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_timing() {
        let config = GatewayConfig::default();
        assert_eq!(config.response_timeout(), Duration::from_secs(3));
        assert_eq!(config.retries, 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = GatewayConfig {
            port: "/dev/ttyUSB1".to_string(),
            retries: 4,
            ..GatewayConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(GatewayConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"COM4\"\nbaud_rate = 57600\n").unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.port, "COM4");
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn rejects_invalid_values() {
        let config = GatewayConfig { local_node_id: 0, ..GatewayConfig::default() };
        assert!(matches!(config.validate(), Err(GatewayError::InvalidNode(0))));

        let config = GatewayConfig { request_timeout_ms: 10, ..GatewayConfig::default() };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }
}
