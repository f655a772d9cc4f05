//! Structured logging with an optional rolling file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Initialize logging. Console output goes to stderr so stdout stays clean
/// for responses.
///
/// The returned guard flushes the file writer and must live until exit.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

  let console = if config.json {
    fmt::layer()
      .with_writer(std::io::stderr)
      .json()
      .boxed()
  } else {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(true)
      .boxed()
  };

  let (file, guard) = match &config.file {
    Some(path) => {
      let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
      let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(console)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn rolling_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or(Path::new("."));
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let file_name = path
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("tandem-sw.log");

  Ok(tracing_appender::rolling::daily(dir, file_name))
}
