//! Cloud channel
//!
//! The bridge talks to the cloud through [`CloudChannel`]: a single
//! long-lived connection that sends telemetry, fetches the device twin,
//! patches reported properties and delivers desired-property pushes.
//! [`IotHubChannel`] is the Azure IoT Hub implementation over MQTT.

mod connection_string;
mod iothub;

pub use connection_string::{generate_sas_token, DeviceConnectionString};
pub use iothub::{topics, IotHubChannel, IotHubOptions};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};

/// Flat JSON object of twin properties
pub type PropertyMap = Map<String, Value>;

/// Full twin as returned by a twin GET
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: PropertyMap,
    #[serde(default)]
    pub reported: PropertyMap,
}

impl TwinDocument {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| BridgeError::Protocol(format!("Invalid twin document: {}", e)))
    }

    pub fn desired_value(&self, key: &str) -> Option<&Value> {
        self.desired.get(key)
    }
}

/// Desired-property change pushed by the cloud. `$version` is kept as an ordinary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinPatch {
    pub properties: PropertyMap,
}

impl TwinPatch {
    pub fn new(properties: PropertyMap) -> Self {
        Self { properties }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(properties)) => Ok(Self { properties }),
            Ok(other) => Err(BridgeError::Protocol(format!(
                "Desired patch is not a JSON object: {}",
                other
            ))),
            Err(e) => Err(BridgeError::Protocol(format!("Invalid desired patch: {}", e))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn version(&self) -> Option<i64> {
        self.properties.get("$version").and_then(Value::as_i64)
    }
}

/// Outbound cloud connection shared by the telemetry and config-sync paths
#[async_trait]
pub trait CloudChannel: Send + Sync {
    /// Send one opaque telemetry payload
    async fn send_event(&self, payload: Vec<u8>) -> Result<()>;

    async fn get_twin(&self) -> Result<TwinDocument>;

    /// Merge `properties` into the reported side of the twin
    async fn update_reported(&self, properties: PropertyMap) -> Result<()>;

    /// Desired-property pushes. Available once; later calls return `None`.
    fn take_desired_updates(&self) -> Option<mpsc::UnboundedReceiver<TwinPatch>>;
}
