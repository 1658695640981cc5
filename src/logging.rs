use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log to a daily-rotated file so stdout stays free for response bodies.
///
/// `RUST_LOG` overrides `level`. Keep the returned guard alive until exit or
/// buffered lines are lost.
pub fn init(level: &str, directory: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", level, e))?;

  let file_appender = tracing_appender::rolling::daily(directory, "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
