//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

const DEFAULT_DIRECTIVES: &str = "graceful_query=info";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. When a log file is configured the
/// returned guard must be kept alive until exit so buffered lines are flushed.
pub fn init(config: &LogConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
  let default = if verbose {
    "graceful_query=debug"
  } else {
    DEFAULT_DIRECTIVES
  };
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  let (writer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
    }
    None => (fmt::writer::BoxMakeWriter::new(std::io::stderr), None),
  };

  let result = if config.json {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().json().with_writer(writer))
      .try_init()
  } else {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_target(true).with_writer(writer))
      .try_init()
  };
  result.map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
