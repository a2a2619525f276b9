//! Bounded fetch orchestrator
//!
//! Produces one [`TelemetryRecord`] per call without ever surfacing a Modbus
//! error to the caller:
//!
//! - connection failures are retried forever, `connect_retry_delay` apart
//! - the voltage + current read runs in its own task under a hard deadline
//! - a read error yields a degraded record after `read_failure_delay`
//! - a missed deadline cancels the read and yields no record at all; the
//!   caller is expected to ask again ([`TelemetryFetcher::fetch_until_record`])

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::modbus::{RegisterConnector, RegisterSource, CURRENT_RANGE, VOLTAGE_RANGE};
use crate::telemetry::TelemetryRecord;

/// Wait between failed connection attempts to the Modbus host
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Wait after a failed register read before handing back the degraded record
pub const READ_FAILURE_DELAY: Duration = Duration::from_secs(5);

/// Hard deadline for the voltage + current read
pub const READ_DEADLINE: Duration = Duration::from_secs(9);

/// Timing knobs for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub connect_retry_delay: Duration,
    pub read_failure_delay: Duration,
    pub read_deadline: Duration,
    /// Pause between back-to-back attempts after a missed deadline (zero = retry immediately)
    pub timeout_retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            connect_retry_delay: CONNECT_RETRY_DELAY,
            read_failure_delay: READ_FAILURE_DELAY,
            read_deadline: READ_DEADLINE,
            timeout_retry_delay: Duration::ZERO,
        }
    }
}

/// Result of a single orchestrator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Both ranges read within the deadline
    Record(TelemetryRecord),
    /// The read failed within the deadline; samples and tag are empty
    Degraded(TelemetryRecord),
    /// The deadline passed; the read was abandoned
    TimedOut,
}

impl FetchOutcome {
    /// `None` only for [`FetchOutcome::TimedOut`]
    pub fn into_record(self) -> Option<TelemetryRecord> {
        match self {
            FetchOutcome::Record(record) | FetchOutcome::Degraded(record) => Some(record),
            FetchOutcome::TimedOut => None,
        }
    }
}

/// Read voltage then current. Stops early if `cancel` fires.
async fn read_samples(
    mut source: Box<dyn RegisterSource>,
    cancel: CancellationToken,
) -> Option<Result<(Vec<i16>, Vec<i16>)>> {
    let read = async {
        let voltage = source
            .read_registers(VOLTAGE_RANGE.address, VOLTAGE_RANGE.count)
            .await?;
        let current = source
            .read_registers(CURRENT_RANGE.address, CURRENT_RANGE.count)
            .await?;
        Ok((voltage, current))
    };

    tokio::select! {
        _ = cancel.cancelled() => None,
        result = read => Some(result),
    }
}

/// Owns the Modbus side of the bridge
pub struct TelemetryFetcher {
    connector: Arc<dyn RegisterConnector>,
    device_id: String,
    policy: FetchPolicy,
}

impl TelemetryFetcher {
    pub fn new(
        connector: Arc<dyn RegisterConnector>,
        device_id: impl Into<String>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            connector,
            device_id: device_id.into(),
            policy,
        }
    }

    /// Open a connection to the Modbus host, retrying until it succeeds.
    pub async fn connect_with_retry(&self) -> Box<dyn RegisterSource> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(source) => {
                    if attempt > 1 {
                        info!(
                            "[OK] Modbus host {} reachable after {} attempts",
                            self.connector.endpoint(),
                            attempt
                        );
                    }
                    return source;
                },
                Err(e) => {
                    error!(
                        "[FAIL] Modbus connection attempt #{} failed: {}",
                        attempt, e
                    );
                    warn!(
                        "Sleeping for {:?} before retrying to talk to Modbus host {}",
                        self.policy.connect_retry_delay,
                        self.connector.endpoint()
                    );
                    sleep(self.policy.connect_retry_delay).await;
                },
            }
        }
    }

    /// One orchestrator invocation.
    pub async fn fetch_once(&self) -> FetchOutcome {
        info!("Fetching MODBUS data...");
        let source = self.connect_with_retry().await;

        let cancel = CancellationToken::new();
        let mut handle = tokio::spawn(read_samples(source, cancel.clone()));

        let read_result = match timeout(self.policy.read_deadline, &mut handle).await {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => {
                // Only reachable if someone else cancelled the token
                warn!("Modbus read cancelled before completion");
                return FetchOutcome::TimedOut;
            },
            Ok(Err(join_err)) => Err(crate::error::BridgeError::Internal(format!(
                "Modbus read task failed: {}",
                join_err
            ))),
            Err(_) => {
                cancel.cancel();
                warn!(
                    "Aborting modbus task, took longer than {:?} to return",
                    self.policy.read_deadline
                );
                return FetchOutcome::TimedOut;
            },
        };

        match read_result {
            Ok((voltage, current)) => {
                debug!("Read voltage {:?} current {:?}", voltage, current);
                FetchOutcome::Record(TelemetryRecord::new(&self.device_id, voltage, current))
            },
            Err(e) => {
                error!("[EXCEPTION] Exception while reading registers: {}", e);
                warn!(
                    "Sleeping for {:?} before reporting an empty reading",
                    self.policy.read_failure_delay
                );
                sleep(self.policy.read_failure_delay).await;
                FetchOutcome::Degraded(TelemetryRecord::degraded(&self.device_id))
            },
        }
    }

    /// One orchestrator invocation; `None` means the read missed its deadline.
    pub async fn fetch(&self) -> Option<TelemetryRecord> {
        self.fetch_once().await.into_record()
    }

    /// Call [`TelemetryFetcher::fetch`] until it yields a record (possibly degraded).
    pub async fn fetch_until_record(&self) -> TelemetryRecord {
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            if let Some(record) = self.fetch().await {
                if attempts > 1 {
                    debug!("Telemetry record obtained after {} attempts", attempts);
                }
                return record;
            }

            if !self.policy.timeout_retry_delay.is_zero() {
                sleep(self.policy.timeout_retry_delay).await;
            }
        }
    }
}
