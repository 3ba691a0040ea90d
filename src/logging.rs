//! Log level option and subscriber installation

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::Result;
use crate::proxy::ProxyOptions;

static INSTALLED: AtomicBool = AtomicBool::new(false);

const DEFAULT_LOG_FILE: &str = "capture-proxy.log";

/// Verbosity of the proxy's own diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
  /// Every event, including per-connection transport detail
  Debug,
  /// Requests, responses and lifecycle
  #[default]
  Info,
  /// Recoverable failures
  Warn,
  /// Failures that stop interception for a host or connection
  Error,
  /// Only errors; kept for option compatibility
  Fatal,
  /// Nothing is logged
  None,
}

impl LogLevel {
  /// `EnvFilter` directive for this level
  pub fn as_filter(&self) -> &'static str {
    match self {
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warn => "warn",
      LogLevel::Error | LogLevel::Fatal => "error",
      LogLevel::None => "off",
    }
  }

  /// Upper-case option name, e.g. `WARN`
  pub fn as_str(&self) -> &'static str {
    match self {
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Warn => "WARN",
      LogLevel::Error => "ERROR",
      LogLevel::Fatal => "FATAL",
      LogLevel::None => "NONE",
    }
  }
}

impl Display for LogLevel {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LogLevel {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "DEBUG" => Ok(LogLevel::Debug),
      "INFO" => Ok(LogLevel::Info),
      "WARN" | "WARNING" => Ok(LogLevel::Warn),
      "ERROR" => Ok(LogLevel::Error),
      "FATAL" => Ok(LogLevel::Fatal),
      "NONE" | "OFF" => Ok(LogLevel::None),
      other => Err(format!("unknown log level `{}`", other)),
    }
  }
}

impl Serialize for LogLevel {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for LogLevel {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Install the global subscriber described by `options`.
///
/// `RUST_LOG` takes precedence over `log_level` when set. With a log file the
/// writer is non-blocking and the returned guard must be kept alive to flush
/// it. Only the first call in a process installs anything; later calls, and
/// calls made after another subscriber was set elsewhere, return `Ok(None)`.
pub fn init(options: &ProxyOptions) -> Result<Option<WorkerGuard>> {
  if INSTALLED.swap(true, Ordering::SeqCst) {
    return Ok(None);
  }
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.log_level.as_filter()));

  let (layer, guard) = match &options.log_file_path {
    Some(path) => {
      let (dir, file) = split_log_path(path);
      std::fs::create_dir_all(dir)?;
      let appender = tracing_appender::rolling::never(dir, file);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter)
        .boxed();
      (layer, Some(guard))
    }
    None => {
      let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter)
        .boxed();
      (layer, None)
    }
  };

  // another subscriber may already own the process
  if tracing_subscriber::registry().with(layer).try_init().is_err() {
    return Ok(None);
  }
  Ok(guard)
}

fn split_log_path(path: &Path) -> (&Path, &str) {
  let dir = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  };
  let file = path
    .file_name()
    .and_then(|s| s.to_str())
    .unwrap_or(DEFAULT_LOG_FILE);
  (dir, file)
}
