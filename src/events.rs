//! Interception events
//!
//! Every stage of a proxied exchange is reported to the registered
//! [`ProxyObserver`]s. Methods returning `bool` gate the step that follows
//! them: observers run in registration order and the first `false` stops both
//! the remaining observers and the gated step.

use crate::errors::Error;
use crate::request::ClientRequest;
use crate::response::ServerResponse;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Identifies the connection an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
  /// Connection number, unique within one proxy run
  pub connection_id: u64,
  /// Milliseconds since the Unix epoch when the event was raised
  pub timestamp: u64,
}

impl EventContext {
  /// Context stamped with the current time
  pub fn new(connection_id: u64) -> Self {
    EventContext {
      connection_id,
      timestamp: crate::timestamp_millis(),
    }
  }
}

/// Addresses of an accepted connection, handed to the initial-connection gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportInfo {
  /// Client address
  pub peer_addr: SocketAddr,
  /// Listener address the client reached
  pub local_addr: SocketAddr,
}

/// Receives interception events.
///
/// Every method has a default: gates accept, notifications do nothing.
#[async_trait::async_trait]
pub trait ProxyObserver: Send + Sync {
  /// A client connected. Return `false` to close it unread.
  async fn initial_connection(&self, _ctx: &EventContext, _transport: &TransportInfo) -> bool {
    true
  }

  /// A `CONNECT` arrived. Return `false` to close the socket without a reply.
  async fn ssl_connection_requested(
    &self,
    _ctx: &EventContext,
    _client_ip: IpAddr,
    _request: &ClientRequest,
  ) -> bool {
    true
  }

  /// The client completed the TLS handshake against the minted certificate.
  async fn ssl_connection_completed(&self, _ctx: &EventContext, _request: &ClientRequest) {}

  /// Certificate issuance or the client handshake failed.
  async fn ssl_connection_failed(&self, _ctx: &EventContext, _error: &Error) {}

  /// A full request, body included, was read. Return `false` to drop it
  /// without forwarding or replying. Changes to `request` are forwarded.
  async fn web_request_received(&self, _ctx: &EventContext, _request: &mut ClientRequest) -> bool {
    true
  }

  /// The origin answered. Return `false` to withhold the response from the
  /// client. Changes to `response` are what the client receives.
  async fn web_response_received(
    &self,
    _ctx: &EventContext,
    _request: &ClientRequest,
    _response: &mut ServerResponse,
  ) -> bool {
    true
  }

  /// The connection is gone, whatever the reason.
  async fn connection_closed(&self, _ctx: &EventContext) {}

  /// The listener stopped.
  async fn proxy_stopped(&self) {}
}

/// Fans events out to every registered observer.
#[derive(Clone, Default)]
pub struct EventDispatcher {
  observers: Vec<Arc<dyn ProxyObserver>>,
}

impl Debug for EventDispatcher {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventDispatcher")
      .field("observers", &self.observers.len())
      .finish()
  }
}

impl EventDispatcher {
  /// Create a dispatcher with no observers
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an observer after the existing ones
  pub fn add(&mut self, observer: Arc<dyn ProxyObserver>) {
    self.observers.push(observer);
  }

  /// Number of registered observers
  pub fn len(&self) -> usize {
    self.observers.len()
  }

  /// Returns true if no observer is registered
  pub fn is_empty(&self) -> bool {
    self.observers.is_empty()
  }

  pub(crate) async fn initial_connection(&self, ctx: &EventContext, transport: &TransportInfo) -> bool {
    for observer in &self.observers {
      if !observer.initial_connection(ctx, transport).await {
        return false;
      }
    }
    true
  }

  pub(crate) async fn ssl_connection_requested(
    &self,
    ctx: &EventContext,
    client_ip: IpAddr,
    request: &ClientRequest,
  ) -> bool {
    for observer in &self.observers {
      if !observer.ssl_connection_requested(ctx, client_ip, request).await {
        return false;
      }
    }
    true
  }

  pub(crate) async fn ssl_connection_completed(&self, ctx: &EventContext, request: &ClientRequest) {
    for observer in &self.observers {
      observer.ssl_connection_completed(ctx, request).await;
    }
  }

  pub(crate) async fn ssl_connection_failed(&self, ctx: &EventContext, error: &Error) {
    for observer in &self.observers {
      observer.ssl_connection_failed(ctx, error).await;
    }
  }

  pub(crate) async fn web_request_received(&self, ctx: &EventContext, request: &mut ClientRequest) -> bool {
    for observer in &self.observers {
      if !observer.web_request_received(ctx, request).await {
        return false;
      }
    }
    true
  }

  pub(crate) async fn web_response_received(
    &self,
    ctx: &EventContext,
    request: &ClientRequest,
    response: &mut ServerResponse,
  ) -> bool {
    for observer in &self.observers {
      if !observer.web_response_received(ctx, request, response).await {
        return false;
      }
    }
    true
  }

  pub(crate) async fn connection_closed(&self, ctx: &EventContext) {
    for observer in &self.observers {
      observer.connection_closed(ctx).await;
    }
  }

  pub(crate) async fn proxy_stopped(&self) {
    for observer in &self.observers {
      observer.proxy_stopped().await;
    }
  }
}

/// Observer that logs every event through `tracing` and never vetoes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[async_trait::async_trait]
impl ProxyObserver for LoggingObserver {
  async fn initial_connection(&self, ctx: &EventContext, transport: &TransportInfo) -> bool {
    tracing::debug!(
      connection_id = ctx.connection_id,
      timestamp = ctx.timestamp,
      peer = %transport.peer_addr,
      "connection accepted"
    );
    true
  }

  async fn ssl_connection_requested(
    &self,
    ctx: &EventContext,
    client_ip: IpAddr,
    request: &ClientRequest,
  ) -> bool {
    tracing::debug!(
      connection_id = ctx.connection_id,
      client_ip = %client_ip,
      target = %request.target,
      "tunnel requested"
    );
    true
  }

  async fn ssl_connection_completed(&self, ctx: &EventContext, request: &ClientRequest) {
    tracing::debug!(connection_id = ctx.connection_id, host = %request.host, "tunnel established");
  }

  async fn ssl_connection_failed(&self, ctx: &EventContext, error: &Error) {
    tracing::warn!(connection_id = ctx.connection_id, error = %error, "tunnel failed");
  }

  async fn web_request_received(&self, ctx: &EventContext, request: &mut ClientRequest) -> bool {
    tracing::info!(
      connection_id = ctx.connection_id,
      request_number = request.number,
      method = %request.method,
      scheme = %request.scheme,
      host = %request.host,
      target = %request.target,
      body_len = request.body.len(),
      "request"
    );
    true
  }

  async fn web_response_received(
    &self,
    ctx: &EventContext,
    request: &ClientRequest,
    response: &mut ServerResponse,
  ) -> bool {
    tracing::info!(
      connection_id = ctx.connection_id,
      request_number = request.number,
      status = response.status.as_u16(),
      body_len = response.body.len(),
      "response"
    );
    true
  }

  async fn connection_closed(&self, ctx: &EventContext) {
    tracing::debug!(connection_id = ctx.connection_id, "connection closed");
  }

  async fn proxy_stopped(&self) {
    tracing::info!("proxy stopped");
  }
}
