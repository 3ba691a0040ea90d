use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;

use capture_proxy::{logging, LogLevel, LoggingObserver, PortPool, ProxyConfig, ProxyOptions, WebServiceProxy};

/// Intercepting HTTP/HTTPS/WebSocket proxy
#[derive(Parser, Debug)]
#[command(name = "capture-proxy")]
#[command(author, version, about = "Intercepting HTTP/HTTPS/WebSocket proxy", long_about = None)]
struct Cli {
  /// Listening port
  #[arg(short, long, default_value = "8888", env = "CAPTURE_PROXY_PORT")]
  port: u16,

  /// Take the first free port of an inclusive range instead, e.g. 8888-8898
  #[arg(long, value_parser = parse_port_range, env = "CAPTURE_PROXY_PORT_RANGE")]
  port_range: Option<PortRange>,

  /// Address to listen on
  #[arg(long, default_value = "0.0.0.0", env = "CAPTURE_PROXY_LISTEN")]
  listen: IpAddr,

  /// Directory holding the root and host certificates
  #[arg(long, default_value = ".capture-proxy", env = "CAPTURE_PROXY_CERT_DIR")]
  cert_dir: PathBuf,

  /// Directory the root certificate is exported to for client installation
  #[arg(long, default_value = ".", env = "CAPTURE_PROXY_EXPORT_DIR")]
  export_dir: PathBuf,

  /// Log file path (logs go to stderr when unset)
  #[arg(long, env = "CAPTURE_PROXY_LOG_FILE")]
  log_file: Option<PathBuf>,

  /// Log level (debug, info, warn, error, fatal, none)
  #[arg(long, default_value = "info", env = "CAPTURE_PROXY_LOG_LEVEL")]
  log_level: LogLevel,

  /// Deadline for each client read, in milliseconds
  #[arg(long, default_value = "1000", env = "CAPTURE_PROXY_READ_TIMEOUT_MS")]
  read_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
  start: u16,
  end: u16,
}

fn parse_port_range(s: &str) -> std::result::Result<PortRange, String> {
  let (start, end) = s
    .split_once('-')
    .ok_or_else(|| format!("expected START-END, got `{}`", s))?;
  let start = start.trim().parse::<u16>().map_err(|e| e.to_string())?;
  let end = end.trim().parse::<u16>().map_err(|e| e.to_string())?;
  Ok(PortRange { start, end })
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let port = match cli.port_range {
    Some(PortRange { start, end }) => {
      let pool = PortPool::new();
      pool.initialize(start, end);
      match pool.obtain() {
        0 => bail!("no free port in {}-{}", start, end),
        port => port,
      }
    }
    None => cli.port,
  };

  let config = ProxyConfig {
    ca_storage_path: cli.cert_dir.clone(),
    listen_address: cli.listen,
    read_timeout: Duration::from_millis(cli.read_timeout_ms),
    ..Default::default()
  };
  let options = ProxyOptions {
    port,
    log_file_path: cli.log_file.clone(),
    log_level: cli.log_level,
  };

  let _log_guard = logging::init(&options).context("failed to install logging")?;

  let proxy = WebServiceProxy::new(config);
  if !proxy.initialize(&cli.export_dir).await {
    bail!("root certificate could not be created or exported");
  }
  proxy.add_observer(Arc::new(LoggingObserver)).await;
  let addr = proxy
    .start(options)
    .await
    .with_context(|| format!("failed to start proxy on port {}", port))?;
  tracing::info!(
    version = env!("CARGO_PKG_VERSION"),
    addr = %addr,
    "capture-proxy ready, press Ctrl-C to stop"
  );

  signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
  tracing::info!("shutting down");
  proxy.stop().await;
  let stats = proxy.stats();
  tracing::info!(
    connections = stats.connections,
    requests = stats.requests,
    responses = stats.responses,
    websockets = stats.websockets,
    failures = stats.failures,
    "final counters"
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn port_range_parses() {
    assert_eq!(
      parse_port_range("8000-8010"),
      Ok(PortRange { start: 8000, end: 8010 })
    );
    assert_eq!(parse_port_range(" 1 - 2 "), Ok(PortRange { start: 1, end: 2 }));
    assert!(parse_port_range("8000").is_err());
    assert!(parse_port_range("a-b").is_err());
  }

  #[test]
  fn cli_reads_log_level() {
    let cli = Cli::parse_from(["capture-proxy", "--log-level", "WARN", "--port-range", "9000-9001"]);
    assert_eq!(cli.log_level, LogLevel::Warn);
    assert_eq!(cli.port_range, Some(PortRange { start: 9000, end: 9001 }));
  }
}
