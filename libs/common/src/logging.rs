//! Console logging for modbridge
//!
//! Installs a single `tracing` subscriber with a reloadable level filter and
//! the bracketed `timestamp [LEVEL] message` format used across the service.

use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Sending message to Azure IoT Hub`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Dynamic log level reload support
type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the default per-crate directive
    pub service_name: String,
    /// Filter applied when `RUST_LOG` is not set (e.g. "info" or "info,modbridge=debug")
    pub level: String,
    /// Emit ANSI colours on the console
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "modbridge".to_string(),
            level: "info".to_string(),
            ansi: true,
        }
    }
}

/// Resolve the effective filter string. `RUST_LOG` wins over the configured level.
fn effective_filter(config: &LogConfig) -> String {
    rust_log_override().unwrap_or_else(|| config.level.clone())
}

fn rust_log_override() -> Option<String> {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|env_str| !env_str.trim().is_empty())
}

/// Initialize logging system with configuration
///
/// Returns an error when the filter is invalid or a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = effective_filter(&config);
    let env_filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid log filter '{}': {}", filter_str, e))?;

    // Wrap EnvFilter with reload::Layer for dynamic level changes
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .try_init()?;

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let level_slot = CURRENT_LOG_LEVEL.get_or_init(|| Mutex::new(String::new()));
    if let Ok(mut guard) = level_slot.lock() {
        *guard = filter_str.clone();
    }

    tracing::debug!("Logging: {} @ {}", config.service_name, filter_str);
    Ok(())
}

/// Shorthand for [`init_with_config`] with only the level set
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        level: level.to_string(),
        ..Default::default()
    })
}

/// Dynamically set log filter level at runtime
///
/// # Arguments
/// * `level` - Log level string (e.g., "debug", "info", "warn")
///   or full filter spec (e.g., "info,modbridge=debug")
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Apply a configured default level unless `RUST_LOG` is set.
///
/// Returns `Ok(false)` when `RUST_LOG` took precedence and nothing was reloaded.
pub fn set_default_level(level: &str) -> Result<bool, String> {
    if let Some(env_str) = rust_log_override() {
        tracing::debug!("RUST_LOG={} overrides configured level {}", env_str, level);
        return Ok(false);
    }
    set_log_level(level)?;
    Ok(true)
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
