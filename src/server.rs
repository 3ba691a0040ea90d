//! Listener and per-connection state machine

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::ca::CertificateManager;
use crate::connection::ConnectionState;
use crate::errors::{Error, Result};
use crate::events::{EventContext, EventDispatcher, TransportInfo};
use crate::request::next_request_number;
use crate::response::ServerResponse;
use crate::upstream::UpstreamClient;
use crate::websocket;

/// Pause after a failed `accept` so a full descriptor table does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-run counters shared by the listener and its connections.
#[derive(Debug, Default)]
pub(crate) struct Counters {
  connection_id: AtomicU64,
  pub(crate) connections: AtomicU64,
  pub(crate) requests: AtomicU64,
  pub(crate) responses: AtomicU64,
  pub(crate) websockets: AtomicU64,
  pub(crate) failures: AtomicU64,
}

impl Counters {
  fn next_connection_id(&self) -> u64 {
    self.connection_id.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub(crate) fn reset(&self) {
    for counter in [
      &self.connection_id,
      &self.connections,
      &self.requests,
      &self.responses,
      &self.websockets,
      &self.failures,
    ] {
      counter.store(0, Ordering::SeqCst);
    }
  }
}

/// Timeouts and limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerSettings {
  pub(crate) read_timeout: Duration,
  pub(crate) max_header_bytes: usize,
  pub(crate) connect_timeout: Duration,
}

/// Everything a connection task needs, shared behind one `Arc`.
pub(crate) struct ProxyServer {
  settings: ServerSettings,
  certificates: Arc<CertificateManager>,
  events: Arc<RwLock<EventDispatcher>>,
  upstream: UpstreamClient,
  counters: Arc<Counters>,
}

impl ProxyServer {
  pub(crate) fn new(
    settings: ServerSettings,
    certificates: Arc<CertificateManager>,
    events: Arc<RwLock<EventDispatcher>>,
    upstream: UpstreamClient,
    counters: Arc<Counters>,
  ) -> Self {
    ProxyServer {
      settings,
      certificates,
      events,
      upstream,
      counters,
    }
  }

  /// Accept until `token` is cancelled, spawning one task per connection.
  pub(crate) async fn run(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
    loop {
      let accepted = tokio::select! {
        _ = token.cancelled() => break,
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          let token = token.clone();
          tokio::spawn(async move {
            server.handle_connection(stream, peer_addr, token).await;
          });
        }
        Err(e) => {
          tracing::error!(error = %e, "failed to accept connection");
          tokio::time::sleep(ACCEPT_BACKOFF).await;
        }
      }
    }
    tracing::debug!("listener loop exited");
  }

  async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr, token: CancellationToken) {
    let id = self.counters.next_connection_id();
    self.counters.connections.fetch_add(1, Ordering::Relaxed);
    let events = self.events.read().await.clone();
    let result = tokio::select! {
      _ = token.cancelled() => {
        tracing::debug!(connection_id = id, "connection cancelled by shutdown");
        Ok(())
      }
      result = self.process(id, stream, &events, token.clone()) => result,
    };
    if let Err(e) = result {
      self.counters.failures.fetch_add(1, Ordering::Relaxed);
      let timestamp = crate::timestamp_millis();
      if e.is_transport() {
        tracing::debug!(connection_id = id, timestamp, peer = %peer_addr, error = %e, "connection aborted");
      } else {
        tracing::warn!(connection_id = id, timestamp, peer = %peer_addr, error = %e, "connection failed");
      }
    }
    events.connection_closed(&EventContext::new(id)).await;
  }

  async fn process(
    &self,
    id: u64,
    stream: TcpStream,
    events: &EventDispatcher,
    token: CancellationToken,
  ) -> Result<()> {
    let mut connection = ConnectionState::new(
      id,
      stream,
      self.settings.read_timeout,
      self.settings.max_header_bytes,
    )?;
    let transport = TransportInfo {
      peer_addr: connection.peer_addr(),
      local_addr: connection.local_addr(),
    };
    if !events.initial_connection(&EventContext::new(id), &transport).await {
      tracing::debug!(connection_id = id, "connection rejected");
      return Ok(());
    }

    let Some(mut request) = connection.read_request().await? else {
      tracing::debug!(connection_id = id, "no request before timeout");
      return Ok(());
    };
    request.number = next_request_number();

    if request.is_connect() {
      connection.record_request(&request);
      let client_ip = transport.peer_addr.ip();
      if !events
        .ssl_connection_requested(&EventContext::new(id), client_ip, &request)
        .await
      {
        tracing::debug!(connection_id = id, target = %request.target, "tunnel rejected");
        return Ok(());
      }
      connection
        .write_response(&ServerResponse::connection_established(request.number))
        .await?;
      connection = match self.intercept_tls(connection, &request.host, request.port).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
          events.ssl_connection_failed(&EventContext::new(id), &e).await;
          return Err(e);
        }
      };
      events
        .ssl_connection_completed(&EventContext::new(id), &request)
        .await;

      request = match connection.read_request().await? {
        Some(inner) => inner,
        None => {
          tracing::debug!(connection_id = id, "no request inside tunnel");
          return Ok(());
        }
      };
      request.number = next_request_number();
      if request.is_connect() {
        return Err(Error::invalid_request("CONNECT inside an intercepted tunnel"));
      }
    }

    connection.read_body(&mut request).await?;
    self.counters.requests.fetch_add(1, Ordering::Relaxed);
    if !events
      .web_request_received(&EventContext::new(id), &mut request)
      .await
    {
      tracing::debug!(connection_id = id, request_number = request.number, "request dropped");
      return Ok(());
    }
    connection.record_request(&request);

    if request.is_upgrade() {
      self.counters.websockets.fetch_add(1, Ordering::Relaxed);
      let counts =
        websocket::bridge(connection, &request, self.settings.connect_timeout, token).await?;
      tracing::debug!(
        connection_id = id,
        request_number = request.number,
        client_to_origin = counts.client_to_origin,
        origin_to_client = counts.origin_to_client,
        "websocket closed"
      );
      return Ok(());
    }

    let upstream = self.upstream.forward(&request).await?;
    let mut response = ServerResponse::from_upstream(request.number, upstream).await?;
    response.finalize_for_client();
    if !events
      .web_response_received(&EventContext::new(id), &request, &mut response)
      .await
    {
      tracing::debug!(connection_id = id, request_number = request.number, "response withheld");
      return Ok(());
    }
    connection.write_response(&response).await?;
    self.counters.responses.fetch_add(1, Ordering::Relaxed);
    connection.close().await;
    Ok(())
  }

  async fn intercept_tls(
    &self,
    connection: ConnectionState,
    host: &str,
    port: u16,
  ) -> Result<ConnectionState> {
    let certificate = self.certificates.get_certificate_for_host(host).await?;
    let acceptor = TlsAcceptor::from(certificate.server_config());
    connection.upgrade_to_tls(acceptor, host, port).await
  }
}
