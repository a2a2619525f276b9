//! modbridge entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::shutdown::wait_for_shutdown;
use tracing::{error, info, warn};

use modbridge::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use modbridge::{
    Bridge, FetchPolicy, IotHubChannel, IotHubOptions, PollingInterval, TcpRegisterConnector,
    TelemetryFetcher,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Modbus TCP to Azure IoT Hub telemetry bridge")]
struct Args {
    /// Configuration file (JSON or YAML); missing file means environment only
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides Bridge.logLevel (RUST_LOG still wins)
    #[arg(short, long, env = "MODBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Last-resort handler: log panics through tracing before the process dies
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("[BombSquad] {}", panic_info);
    }));
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    if args.log_level.is_none() {
        if let Err(e) = common::logging::set_default_level(&config.bridge.log_level) {
            warn!("Ignoring logLevel '{}': {}", config.bridge.log_level, e);
        }
    }
    info!("Log filter: {}", common::logging::get_log_level());

    let cs = &config.connection_strings;
    info!(
        "Modbus host {}:{} (unit {}), device id {}",
        cs.modbus_host, cs.modbus_port, config.bridge.unit_id, config.bridge.device_id
    );

    let connector = Arc::new(TcpRegisterConnector::new(
        cs.modbus_host.clone(),
        cs.modbus_port,
        config.bridge.unit_id,
    ));
    let fetcher = TelemetryFetcher::new(
        connector,
        config.bridge.device_id.clone(),
        FetchPolicy::default(),
    );

    let channel = IotHubChannel::connect(config.device_connection()?, IotHubOptions::default())
        .await
        .context("Failed to open IoT Hub connection")?;
    let interval = PollingInterval::new(config.default_polling_interval()?);

    let bridge = Bridge::new(fetcher, Arc::new(channel), interval);

    tokio::select! {
        result = bridge.run() => result.context("Bridge stopped"),
        signal = wait_for_shutdown() => {
            info!("Received {}, shutting down", signal);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    if let Err(e) = common::logging::init(&level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    install_panic_hook();

    info!("Starting modbridge v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("[BombSquad] {:#}", e);
        std::process::exit(1);
    }
}
