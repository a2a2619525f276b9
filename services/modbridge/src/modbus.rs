//! Register reader
//!
//! The orchestrator only needs two operations from the device side: open a
//! connection, and read N contiguous holding registers. Both are traits so
//! the fetch logic can be driven by in-memory sources in tests; the real
//! implementation is Modbus TCP via `tokio-modbus`.
//!
//! No retry happens here. Retry policy belongs to [`crate::fetch`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::slave::Slave;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// A contiguous block of holding registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRange {
    pub address: u16,
    pub count: u16,
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.address, self.count)
    }
}

/// Voltage samples (three phases)
pub const VOLTAGE_RANGE: RegisterRange = RegisterRange {
    address: 40001,
    count: 3,
};

/// Current samples (three phases)
pub const CURRENT_RANGE: RegisterRange = RegisterRange {
    address: 41001,
    count: 3,
};

/// Default TCP connect timeout for the Modbus host
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An open connection that can read registers
#[async_trait]
pub trait RegisterSource: Send {
    /// Read `count` holding registers starting at `address`, as signed 16-bit values
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<i16>>;
}

/// Opens [`RegisterSource`] connections
#[async_trait]
pub trait RegisterConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RegisterSource>>;

    /// Human-readable target, for logs
    fn endpoint(&self) -> String;
}

/// Reinterpret raw register words as two's-complement values
pub fn words_to_i16(words: &[u16]) -> Vec<i16> {
    words.iter().map(|&w| w as i16).collect()
}

/// Modbus TCP connector
#[derive(Debug, Clone)]
pub struct TcpRegisterConnector {
    host: String,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
}

impl TcpRegisterConnector {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl RegisterConnector for TcpRegisterConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterSource>> {
        let endpoint = self.endpoint();
        debug!("Connecting to Modbus TCP server at {}", endpoint);

        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BridgeError::Connection(format!(
                    "Failed to connect to Modbus TCP server {}: {}",
                    endpoint, e
                )))
            },
            Err(_) => {
                return Err(BridgeError::Connection(format!(
                    "Connection to Modbus TCP server {} timed out after {:?}",
                    endpoint, self.connect_timeout
                )))
            },
        };

        // Modbus frames are tiny; do not wait to coalesce them
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }

        let ctx = tcp::attach_slave(stream, Slave(self.unit_id));
        debug!("Connected to Modbus TCP server at {}", endpoint);

        Ok(Box::new(TcpRegisterSource { ctx, endpoint }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Open Modbus TCP session; the socket closes when this is dropped
struct TcpRegisterSource {
    ctx: Context,
    endpoint: String,
}

#[async_trait]
impl RegisterSource for TcpRegisterSource {
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<i16>> {
        let words = self
            .ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| {
                BridgeError::Read(format!(
                    "Read of {} registers at {} from {} failed: {}",
                    count, address, self.endpoint, e
                ))
            })?;

        if words.len() != usize::from(count) {
            return Err(BridgeError::Read(format!(
                "Expected {} registers at {}, device returned {}",
                count,
                address,
                words.len()
            )));
        }

        Ok(words_to_i16(&words))
    }
}
