//! Structured logging with tracing
//!
//! Sets up:
//! - Console logging on stderr (text or JSON)
//! - File logging with daily rotation (JSON), when a log directory is configured
//! - Filtering from RUST_LOG

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling::daily};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use super::config::{LogFormat, MonitoringConfig};

/// Initialize the global tracing subscriber.
///
/// Returns the file appender guard when file logging is on; keep it alive for
/// the duration of the program, dropping it stops file logging. Calling this
/// twice leaves the first subscriber in place.
pub fn init_tracing(config: &MonitoringConfig) -> std::io::Result<Option<WorkerGuard>> {
    config.ensure_log_dir()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let console_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match &config.log_dir {
        Some(dir) => {
            let file_appender = daily(dir, "cache-tags.log");
            let (non_blocking_file, guard) = non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false) // No ANSI codes in files
                .json();

            let _ = registry.with(file_layer).try_init();
            Ok(Some(guard))
        }
        None => {
            let _ = registry.try_init();
            Ok(None)
        }
    }
}
