//! Tracing setup. Stdout carries the tool protocol, so logs go to a daily
//! rolling file (or stderr when asked).

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directives
pub const LOG_ENV: &str = "CBGATE_LOG";
const DEFAULT_FILTER: &str = "cbgate=info";

/// Directory for log files: $XDG_DATA_HOME/cbgate/logs
pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("cbgate").join("logs"))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive for the lifetime of the program.
pub fn init(to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  if to_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to init logging: {}", e))?;
    return Ok(None);
  }

  let dir = log_dir().ok_or_else(|| eyre!("Could not determine data directory for logs"))?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &dir,
    "cbgate.log",
  ));
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;

  Ok(Some(guard))
}
