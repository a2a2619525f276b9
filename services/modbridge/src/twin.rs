//! Config sync manager
//!
//! Owns the polling interval and keeps it consistent with the device twin:
//! once at startup (pull) and on every desired-property push. After every
//! sync event the effective value is echoed to the reported side, whether or
//! not it changed.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::serde_helpers::parse_positive_seconds;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cloud::{CloudChannel, PropertyMap, TwinPatch};
use crate::error::Result;

/// Twin property carrying the polling interval in seconds
pub const POLLING_INTERVAL_KEY: &str = "pollingInterval";

/// Shared handle to the current polling interval.
///
/// Positive by construction; clones observe the same value.
#[derive(Debug, Clone)]
pub struct PollingInterval(Arc<AtomicU32>);

impl PollingInterval {
    pub fn new(initial: NonZeroU32) -> Self {
        Self(Arc::new(AtomicU32::new(initial.get())))
    }

    pub fn get(&self) -> NonZeroU32 {
        // Only non-zero values are ever stored
        NonZeroU32::new(self.0.load(Ordering::Acquire)).unwrap_or(NonZeroU32::MIN)
    }

    pub fn seconds(&self) -> u32 {
        self.get().get()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.seconds()))
    }

    /// Store a new value, returning the previous one
    pub fn set(&self, seconds: NonZeroU32) -> NonZeroU32 {
        let previous = self.0.swap(seconds.get(), Ordering::AcqRel);
        NonZeroU32::new(previous).unwrap_or(NonZeroU32::MIN)
    }
}

pub struct ConfigSync {
    channel: Arc<dyn CloudChannel>,
    interval: PollingInterval,
}

impl ConfigSync {
    pub fn new(channel: Arc<dyn CloudChannel>, interval: PollingInterval) -> Self {
        Self { channel, interval }
    }

    pub fn interval(&self) -> &PollingInterval {
        &self.interval
    }

    /// Returns true if the interval changed. Malformed values are logged and ignored.
    fn apply_desired(&self, desired: Option<&Value>) -> bool {
        let Some(value) = desired else {
            return false;
        };

        match parse_positive_seconds(value) {
            Ok(seconds) if seconds == self.interval.get() => false,
            Ok(seconds) => {
                let previous = self.interval.set(seconds);
                info!(
                    "Polling interval changed from {}s to {}s",
                    previous, seconds
                );
                true
            },
            Err(e) => {
                error!(
                    "[EXCEPTION] Ignoring desired {} = {}: {}",
                    POLLING_INTERVAL_KEY, value, e
                );
                false
            },
        }
    }

    /// Publish the current interval as a reported property
    pub async fn report_current(&self) -> Result<()> {
        let mut properties = PropertyMap::new();
        properties.insert(
            POLLING_INTERVAL_KEY.to_string(),
            json!(self.interval.seconds()),
        );
        self.channel.update_reported(properties).await
    }

    /// Pull the twin once and adopt its desired interval.
    ///
    /// A twin fetch failure is returned to the caller; a failed report is only logged.
    pub async fn reconcile_startup(&self) -> Result<()> {
        let twin = self.channel.get_twin().await?;
        self.apply_desired(twin.desired_value(POLLING_INTERVAL_KEY));

        if let Err(e) = self.report_current().await {
            warn!("Failed to report initial polling interval: {}", e);
        }

        info!("Polling interval: {}s", self.interval.seconds());
        Ok(())
    }

    /// React to one desired-property push
    pub async fn handle_desired(&self, patch: &TwinPatch) -> Result<()> {
        info!("Desired property change:");
        for (key, value) in &patch.properties {
            info!("  {}: {}", key, value);
        }

        self.apply_desired(patch.get(POLLING_INTERVAL_KEY));
        self.report_current().await
    }

    /// Consume desired-property pushes until the channel closes
    pub fn spawn_listener(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<TwinPatch>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(patch) = updates.recv().await {
                if let Err(e) = self.handle_desired(&patch).await {
                    error!("Failed to report polling interval: {}", e);
                }
            }
            warn!("Desired property stream closed, listener stopped");
        })
    }
}
