#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # capture-proxy
//!
//! The `capture_proxy` crate provides an intercepting HTTP/HTTPS/WebSocket
//! proxy. It terminates client TLS with host certificates minted on demand by
//! a local root CA, forwards every request to the real origin, and raises an
//! event around each stage so the embedding application can record, rewrite
//! or reject traffic.
//!
//! - Root CA creation, export and per-host certificate issuance
//! - `CONNECT` tunnels upgraded to TLS in-process
//! - WebSocket upgrades relayed frame by frame
//! - Observer hooks with synchronous veto decisions
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use capture_proxy::{ProxyConfig, ProxyOptions, WebServiceProxy};
//!
//! # async fn run() -> capture_proxy::Result<()> {
//! let proxy = WebServiceProxy::new(ProxyConfig::default());
//! if !proxy.initialize("./export").await {
//!   return Ok(());
//! }
//! let addr = proxy.start(ProxyOptions::default()).await?;
//! println!("listening on {addr}");
//! proxy.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Observing traffic
//!
//! Implement [`ProxyObserver`] and register it with
//! [`WebServiceProxy::add_observer`]. Methods returning `bool` are vetoes: the
//! gated step only runs if every observer returns `true`.
//!
//! ```rust
//! use capture_proxy::{ClientRequest, EventContext, ProxyObserver};
//!
//! struct BlockTracking;
//!
//! #[async_trait::async_trait]
//! impl ProxyObserver for BlockTracking {
//!   async fn web_request_received(&self, _ctx: &EventContext, request: &mut ClientRequest) -> bool {
//!     !request.host.ends_with("tracking.example")
//!   }
//! }
//! ```
//!
pub mod ca;
mod connection;
mod errors;
pub mod events;
mod headers;
pub mod logging;
pub mod port_pool;
mod proxy;
mod request;
mod response;
mod server;
mod socket;
mod tls;
mod upstream;
pub mod websocket;

pub use ca::{CertificateManager, HostCertificate, RootCertificate};
pub use connection::ConnectionState;
pub use errors::{Error, Result};
pub use events::{EventContext, LoggingObserver, ProxyObserver, TransportInfo};
pub use headers::{is_content_header, HeaderCollection};
pub use http::Method;
pub use http::Version;
pub use logging::LogLevel;
pub use port_pool::PortPool;
pub use proxy::{ProxyConfig, ProxyOptions, ProxyStats, WebServiceProxy};
pub use request::{read_request_head, ClientRequest, Scheme};
pub use response::{read_response_head, ServerResponse};
pub use socket::{MaybeTlsStream, Socket};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Milliseconds since the Unix epoch, the timestamp carried by every event.
pub(crate) fn timestamp_millis() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}
