//! Runtime configuration for the bus and the command server.
//!
//! Values come from an optional JSON file and are then overridden by
//! command-line flags in the server binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{FrameCodec, WireVariant, DEFAULT_SOF_SEARCH_LIMIT};
use crate::transport::DEFAULT_BAUD;

pub const DEFAULT_RETRY_COUNT: u8 = 2;
pub const DEFAULT_BYTE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_INTER_COMMAND_DELAY_MS: u64 = 5;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REGISTRY_FILE: &str = "./flapconfig.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub wire: WireVariant,
    /// Decode attempts per request, foreign frames included.
    pub retry_count: u8,
    pub byte_timeout_ms: u64,
    pub sof_search_limit: usize,
    /// Pause between consecutive flap commands while rendering text.
    pub inter_command_delay_ms: u64,
    /// Drive the adapter's DTR line around each transmission.
    pub direction_control: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            wire: WireVariant::V1,
            retry_count: DEFAULT_RETRY_COUNT,
            byte_timeout_ms: DEFAULT_BYTE_TIMEOUT_MS,
            sof_search_limit: DEFAULT_SOF_SEARCH_LIMIT,
            inter_command_delay_ms: DEFAULT_INTER_COMMAND_DELAY_MS,
            direction_control: false,
        }
    }
}

impl BusConfig {
    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.wire).with_sof_search_limit(self.sof_search_limit)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_count == 0 {
            return Err(ConfigError::Invalid("retry_count must be at least 1".into()));
        }
        if self.byte_timeout_ms == 0 {
            return Err(ConfigError::Invalid("byte_timeout_ms must be positive".into()));
        }
        if self.sof_search_limit == 0 {
            return Err(ConfigError::Invalid(
                "sof_search_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub device: Option<String>,
    pub baud: u32,
    pub registry_file: PathBuf,
    pub load_on_start: bool,
    /// Run against this many simulated units instead of a serial device.
    pub simulate: Option<u16>,
    pub bus: BusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            device: None,
            baud: DEFAULT_BAUD,
            registry_file: PathBuf::from(DEFAULT_REGISTRY_FILE),
            load_on_start: false,
            simulate: None,
            bus: BusConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        if self.device.is_none() && self.simulate.is_none() {
            return Err(ConfigError::Invalid(
                "either a serial device or --simulate is required".into(),
            ));
        }
        if self.baud == 0 {
            return Err(ConfigError::Invalid("baud must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_unit_firmware() {
        let config = ServerConfig::default();
        assert_eq!(config.baud, 19_200);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bus.retry_count, 2);
        assert_eq!(config.bus.byte_timeout(), Duration::from_millis(100));
        assert_eq!(config.bus.wire, WireVariant::V1);
        assert_eq!(config.registry_file, PathBuf::from("./flapconfig.json"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"device": "/dev/ttyUSB1", "bus": {{"wire": "v2", "retry_count": 4}}}}"#
        )
        .unwrap();

        let config = ServerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.device.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.bus.wire, WireVariant::V2);
        assert_eq!(config.bus.retry_count, 4);
        assert_eq!(config.bus.sof_search_limit, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let mut config = ServerConfig {
            simulate: Some(2),
            ..ServerConfig::default()
        };
        config.bus.retry_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_requires_a_bus() {
        assert!(matches!(
            ServerConfig::default().validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ServerConfig::from_json_file(Path::new("/nonexistent/flapbus.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
