//! Shutdown signal handling for long-running services

use std::fmt;

use tracing::warn;

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix (container stop).
///
/// If the SIGTERM handler cannot be installed only Ctrl+C is honoured.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler, only Ctrl+C will stop the service: {}", e);
                None
            },
        };

        let terminate = async {
            match term_signal.as_mut() {
                Some(sig) => {
                    sig.recv().await;
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminate => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        ShutdownSignal::Interrupt
    }
}
