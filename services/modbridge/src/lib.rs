//! Modbus TCP to Azure IoT Hub telemetry bridge
//!
//! Polls voltage and current holding registers from one Modbus device,
//! publishes them as JSON telemetry, and lets the cloud tune the polling
//! interval through the device twin.
//!
//! - [`modbus`]: register reader (connect, read N registers)
//! - [`fetch`]: bounded fetch orchestrator (retry, deadline, degrade)
//! - [`twin`]: polling interval and its sync with the twin
//! - [`bridge`]: main loop driver
//! - [`cloud`]: IoT Hub channel

pub mod bridge;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fetch;
pub mod modbus;
pub mod telemetry;
pub mod twin;

pub use bridge::Bridge;
pub use cloud::{CloudChannel, IotHubChannel, IotHubOptions, TwinDocument, TwinPatch};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use fetch::{FetchOutcome, FetchPolicy, TelemetryFetcher};
pub use modbus::{RegisterConnector, RegisterSource, TcpRegisterConnector};
pub use telemetry::TelemetryRecord;
pub use twin::{ConfigSync, PollingInterval};
