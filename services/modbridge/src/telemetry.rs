//! Telemetry record sent to the cloud once per polling cycle

use serde::Serialize;

use crate::error::Result;

/// Source tag stamped on records produced by a successful register read
pub const SOURCE_TAG: &str = "Function Code 0x2b (43)";

/// One polling cycle's worth of readings.
///
/// Serializes to `{"deviceId", "voltage", "current", "hardwareId"}`. A
/// degraded record (read failed) carries empty sample lists and an empty tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    device_id: String,
    #[serde(rename = "voltage")]
    voltage_samples: Vec<i16>,
    #[serde(rename = "current")]
    current_samples: Vec<i16>,
    #[serde(rename = "hardwareId")]
    source_tag: String,
}

impl TelemetryRecord {
    /// Record populated from a successful read
    pub fn new(device_id: impl Into<String>, voltage: Vec<i16>, current: Vec<i16>) -> Self {
        Self {
            device_id: device_id.into(),
            voltage_samples: voltage,
            current_samples: current,
            source_tag: SOURCE_TAG.to_string(),
        }
    }

    /// Record for a cycle whose read failed
    pub fn degraded(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            voltage_samples: Vec::new(),
            current_samples: Vec::new(),
            source_tag: String::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn voltage(&self) -> &[i16] {
        &self.voltage_samples
    }

    pub fn current(&self) -> &[i16] {
        &self.current_samples
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    pub fn is_degraded(&self) -> bool {
        self.source_tag.is_empty()
    }

    /// Compact UTF-8 JSON payload, consumed once by the publish step
    pub fn into_payload(self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self)?)
    }

    /// Indented JSON for debug logging
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
