//! Main loop driver
//!
//! `start` syncs the polling interval with the twin and only then starts
//! listening for desired-property pushes. `run` then loops forever:
//! fetch, serialize, publish, sleep for the current interval.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn, Level};

use crate::cloud::CloudChannel;
use crate::error::Result;
use crate::fetch::TelemetryFetcher;
use crate::twin::{ConfigSync, PollingInterval};

pub struct Bridge {
    fetcher: TelemetryFetcher,
    channel: Arc<dyn CloudChannel>,
    sync: Arc<ConfigSync>,
    listener: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(
        fetcher: TelemetryFetcher,
        channel: Arc<dyn CloudChannel>,
        interval: PollingInterval,
    ) -> Self {
        let sync = Arc::new(ConfigSync::new(channel.clone(), interval));
        Self {
            fetcher,
            channel,
            sync,
            listener: None,
        }
    }

    pub fn interval(&self) -> &PollingInterval {
        self.sync.interval()
    }

    /// Startup reconciliation followed by listener registration
    pub async fn start(&mut self) -> Result<()> {
        self.sync.reconcile_startup().await?;

        match self.channel.take_desired_updates() {
            Some(updates) => {
                self.listener = Some(self.sync.clone().spawn_listener(updates));
                info!("Listening for desired property changes");
            },
            None => warn!("Desired property updates already taken, not listening"),
        }
        Ok(())
    }

    /// One fetch, serialize, publish pass
    pub async fn run_cycle(&self) -> Result<()> {
        let record = self.fetcher.fetch_until_record().await;

        if tracing::enabled!(Level::DEBUG) {
            if let Ok(pretty) = record.to_pretty_json() {
                debug!("Telemetry record:\n{}", pretty);
            }
        }

        let degraded = record.is_degraded();
        let payload = record.into_payload()?;
        let size = payload.len();
        self.channel.send_event(payload).await?;

        if degraded {
            warn!("Sent empty telemetry record ({} bytes)", size);
        } else {
            info!("Sent telemetry record ({} bytes)", size);
        }
        Ok(())
    }

    /// Never returns `Ok`
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        loop {
            self.run_cycle().await?;

            let wait = self.interval().duration();
            debug!("Sleeping {:?} until next poll", wait);
            sleep(wait).await;
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
