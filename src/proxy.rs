//! Proxy configuration and lifecycle

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

use crate::ca::CertificateManager;
use crate::errors::{Error, Result};
use crate::events::{EventDispatcher, ProxyObserver};
use crate::logging::{self, LogLevel};
use crate::server::{Counters, ProxyServer, ServerSettings};
use crate::upstream::UpstreamClient;

const LISTEN_BACKLOG: i32 = 1024;

/// Options passed to [`WebServiceProxy::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
  /// Listening port; `0` picks an ephemeral one
  pub port: u16,
  /// Write logs to this file instead of stderr
  pub log_file_path: Option<PathBuf>,
  /// Verbosity of the proxy's diagnostics
  pub log_level: LogLevel,
}

impl Default for ProxyOptions {
  fn default() -> Self {
    Self {
      port: 8888,
      log_file_path: None,
      log_level: LogLevel::Info,
    }
  }
}

/// Construction-time settings for a [`WebServiceProxy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Directory holding the root and persisted host certificates
  pub ca_storage_path: PathBuf,
  /// Subject common name of the root certificate
  pub ca_common_name: String,
  /// Write issued host certificates to `ca_storage_path/hosts`
  pub persist_host_certificates: bool,
  /// Address the listener binds to
  pub listen_address: IpAddr,
  /// Deadline for every single client read or write
  #[serde(with = "duration_ms")]
  pub read_timeout: Duration,
  /// How long `stop` waits for the listener to exit
  #[serde(with = "duration_ms")]
  pub shutdown_timeout: Duration,
  /// Deadline for a whole outbound exchange, and for connecting to a
  /// WebSocket origin
  #[serde(with = "duration_ms")]
  pub upstream_timeout: Duration,
  /// Skip certificate validation when forwarding plain requests to origins
  pub accept_invalid_upstream_certs: bool,
  /// Largest request line plus headers accepted from a client
  pub max_header_bytes: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".capture-proxy"),
      ca_common_name: String::from("Capture Proxy Root CA"),
      persist_host_certificates: true,
      listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      read_timeout: Duration::from_secs(1),
      shutdown_timeout: Duration::from_secs(5),
      upstream_timeout: Duration::from_secs(60),
      accept_invalid_upstream_certs: false,
      max_header_bytes: 64 * 1024,
    }
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

/// Counters for the current run, as returned by [`WebServiceProxy::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
  /// Connections accepted
  pub connections: u64,
  /// Requests read in full, body included
  pub requests: u64,
  /// Responses written back to clients
  pub responses: u64,
  /// Upgrade requests bridged as WebSockets
  pub websockets: u64,
  /// Connections that ended with an error
  pub failures: u64,
}

struct Running {
  token: CancellationToken,
  handle: JoinHandle<()>,
  local_addr: SocketAddr,
}

/// An intercepting HTTP/HTTPS/WebSocket proxy.
///
/// One instance owns one certificate authority, one set of observers and at
/// most one listener at a time. It can be started again after `stop`.
pub struct WebServiceProxy {
  config: ProxyConfig,
  certificates: Arc<CertificateManager>,
  events: Arc<RwLock<EventDispatcher>>,
  counters: Arc<Counters>,
  running: Mutex<Option<Running>>,
  log_guard: Mutex<Option<WorkerGuard>>,
}

impl WebServiceProxy {
  /// Create a stopped proxy. Nothing touches disk or network yet.
  pub fn new(config: ProxyConfig) -> Self {
    let certificates = Arc::new(CertificateManager::new(
      &config.ca_storage_path,
      config.ca_common_name.clone(),
      config.persist_host_certificates,
    ));
    Self {
      config,
      certificates,
      events: Arc::new(RwLock::new(EventDispatcher::new())),
      counters: Arc::new(Counters::default()),
      running: Mutex::new(None),
      log_guard: Mutex::new(None),
    }
  }

  /// Load or generate the root certificate and export it to `export_path`
  /// so clients can trust it.
  ///
  /// Returns `false` if either step fails; the proxy cannot intercept TLS
  /// until this succeeds.
  pub async fn initialize(&self, export_path: impl AsRef<Path>) -> bool {
    let export_path = export_path.as_ref();
    if let Err(e) = self.certificates.ensure_root_certificate().await {
      tracing::error!(error = %e, "root certificate unavailable");
      return false;
    }
    match self.certificates.export_root_certificate(export_path).await {
      Ok((der, pem)) => {
        tracing::info!(der = %der.display(), pem = %pem.display(), "install the root certificate on clients");
        true
      }
      Err(e) => {
        tracing::error!(path = %export_path.display(), error = %e, "could not export root certificate");
        false
      }
    }
  }

  /// Install logging and start accepting on `options.port`.
  ///
  /// Returns the bound address. Fails if the proxy is already running or the
  /// port cannot be bound.
  pub async fn start(&self, options: ProxyOptions) -> Result<SocketAddr> {
    if self.is_running() {
      return Err(Error::proxy_error("proxy is already running"));
    }
    if let Some(guard) = logging::init(&options)? {
      *self.log_guard.lock() = Some(guard);
    }
    self.certificates.ensure_root_certificate().await?;

    let listener = bind(SocketAddr::new(self.config.listen_address, options.port))?;
    let local_addr = listener.local_addr()?;
    let upstream = UpstreamClient::new(
      self.config.upstream_timeout,
      self.config.accept_invalid_upstream_certs,
    )?;
    let settings = ServerSettings {
      read_timeout: self.config.read_timeout,
      max_header_bytes: self.config.max_header_bytes,
      connect_timeout: self.config.upstream_timeout,
    };
    let server = Arc::new(ProxyServer::new(
      settings,
      self.certificates.clone(),
      self.events.clone(),
      upstream,
      self.counters.clone(),
    ));

    let mut running = self.running.lock();
    if running.is_some() {
      return Err(Error::proxy_error("proxy is already running"));
    }
    let token = CancellationToken::new();
    let handle = tokio::spawn(server.run(listener, token.clone()));
    *running = Some(Running {
      token,
      handle,
      local_addr,
    });
    tracing::info!(addr = %local_addr, "proxy listening");
    Ok(local_addr)
  }

  /// Stop accepting and cancel every open connection.
  ///
  /// Waits at most `shutdown_timeout` for the listener to exit, then raises
  /// `proxy_stopped`. Does nothing if the proxy is not running.
  pub async fn stop(&self) {
    let Some(running) = self.running.lock().take() else {
      return;
    };
    running.token.cancel();
    match tokio::time::timeout(self.config.shutdown_timeout, running.handle).await {
      Ok(Ok(())) => tracing::debug!(addr = %running.local_addr, "listener exited"),
      Ok(Err(e)) => tracing::warn!(error = %e, "listener task failed"),
      Err(_) => tracing::warn!(
        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
        "listener did not exit in time"
      ),
    }
    let events = self.events.read().await.clone();
    events.proxy_stopped().await;
  }

  /// Zero the counters and restart connection numbering.
  pub fn reset(&self) {
    self.counters.reset();
  }

  /// Snapshot of the current run's counters
  pub fn stats(&self) -> ProxyStats {
    ProxyStats {
      connections: self.counters.connections.load(Ordering::Relaxed),
      requests: self.counters.requests.load(Ordering::Relaxed),
      responses: self.counters.responses.load(Ordering::Relaxed),
      websockets: self.counters.websockets.load(Ordering::Relaxed),
      failures: self.counters.failures.load(Ordering::Relaxed),
    }
  }

  /// Register an observer. Connections accepted from now on see it.
  pub async fn add_observer(&self, observer: Arc<dyn ProxyObserver>) {
    self.events.write().await.add(observer);
  }

  /// Shared observer registry
  pub fn events(&self) -> Arc<RwLock<EventDispatcher>> {
    self.events.clone()
  }

  /// The certificate authority used for interception
  pub fn certificates(&self) -> Arc<CertificateManager> {
    self.certificates.clone()
  }

  /// Settings this proxy was created with
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Bound address while running
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.running.lock().as_ref().map(|r| r.local_addr)
  }

  /// Returns true between a successful `start` and the next `stop`
  pub fn is_running(&self) -> bool {
    self.running.lock().is_some()
  }
}

impl Drop for WebServiceProxy {
  fn drop(&mut self) {
    if let Some(running) = self.running.get_mut().take() {
      running.token.cancel();
    }
  }
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
  let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(LISTEN_BACKLOG)?;
  Ok(TcpListener::from_std(socket.into())?)
}
