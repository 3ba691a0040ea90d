//! Error types for the capture proxy
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `capture_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting a connection.
///
/// Event vetoes are not errors; they surface as plain `bool` decisions on the
/// [`ProxyObserver`](crate::ProxyObserver) methods.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Socket, file or timeout error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed chunk size or numeric header
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Certificate issuance or storage error
  #[error("Certificate error: {0}")]
  Certificate(String),
  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),
  /// Unparsable request line, header or target
  #[error("Invalid request: {0}")]
  InvalidRequest(String),
  /// A read or write did not complete in time
  #[error("Timed out: {0}")]
  Timeout(String),
  /// Outbound HTTP request failed
  #[error(transparent)]
  Upstream(#[from] reqwest::Error),
  /// WebSocket handshake or relay failure
  #[error(transparent)]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
  /// Lifecycle misuse, e.g. starting twice
  #[error("Proxy error: {0}")]
  Proxy(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// True for timeouts and peer resets, the failures that only abort one connection.
  pub fn is_transport(&self) -> bool {
    match self {
      Error::Timeout(_) => true,
      Error::Io(e) => matches!(
        e.kind(),
        ErrorKind::TimedOut
          | ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
          | ErrorKind::UnexpectedEof
      ),
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Tls(value.to_string())
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::Certificate(value.to_string())
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::Timeout(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
