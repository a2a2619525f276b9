//! Bridge configuration
//!
//! Loaded once at startup from `appsettings.json` (optional) merged with
//! environment variables such as `ConnectionStrings__modbusHost`; environment
//! wins. Any missing or invalid value is fatal.

use std::num::NonZeroU32;
use std::path::Path;

use common::config_loader::LayeredConfig;
use common::serde_helpers::{
    deserialize_u16_flexible, deserialize_u32_flexible, deserialize_u8_flexible,
};
use serde::Deserialize;

use crate::cloud::DeviceConnectionString;
use crate::error::{BridgeError, Result};

/// Default configuration file, looked up relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "appsettings.json";

/// Telemetry `deviceId` used when none is configured
pub const DEFAULT_DEVICE_ID: &str = "ModbusCollector";

/// Polling interval (seconds) in effect until the twin overrides it
pub const DEFAULT_POLLING_INTERVAL_SECS: u32 = 11;

/// Complete bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "ConnectionStrings")]
    pub connection_strings: ConnectionStrings,
    #[serde(rename = "Bridge", default)]
    pub bridge: BridgeSettings,
}

/// Endpoints and credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStrings {
    pub modbus_host: String,
    #[serde(deserialize_with = "deserialize_u16_flexible")]
    pub modbus_port: u16,
    pub device_conn_str: String,
}

/// Optional tuning knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_unit_id", deserialize_with = "deserialize_u8_flexible")]
    pub unit_id: u8,
    #[serde(
        default = "default_polling_interval",
        deserialize_with = "deserialize_u32_flexible"
    )]
    pub default_polling_interval: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}

fn default_unit_id() -> u8 {
    1
}

fn default_polling_interval() -> u32 {
    DEFAULT_POLLING_INTERVAL_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            unit_id: default_unit_id(),
            default_polling_interval: default_polling_interval(),
            log_level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    /// Load from `path` plus `ConnectionStrings__*` / `Bridge__*` environment variables,
    /// then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: BridgeConfig = LayeredConfig::new()
            .add_file(path)
            .env_section("ConnectionStrings")
            .env_section("Bridge")
            .load()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        let cs = &self.connection_strings;

        if cs.modbus_host.trim().is_empty() {
            return Err(BridgeError::Config("modbusHost cannot be empty".to_string()));
        }
        if cs.modbus_port == 0 {
            return Err(BridgeError::Config("modbusPort must be 1-65535".to_string()));
        }
        DeviceConnectionString::parse(&cs.device_conn_str)?;

        if self.bridge.device_id.trim().is_empty() {
            return Err(BridgeError::Config("deviceId cannot be empty".to_string()));
        }
        self.default_polling_interval()?;
        Ok(())
    }

    /// Parsed IoT Hub credentials (validated in [`BridgeConfig::validate`])
    pub fn device_connection(&self) -> Result<DeviceConnectionString> {
        DeviceConnectionString::parse(&self.connection_strings.device_conn_str)
    }

    /// Starting value for the polling interval
    pub fn default_polling_interval(&self) -> Result<NonZeroU32> {
        NonZeroU32::new(self.bridge.default_polling_interval).ok_or_else(|| {
            BridgeError::Config("defaultPollingInterval must be greater than zero".to_string())
        })
    }
}
