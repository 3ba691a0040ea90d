use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{Error, Result};
use crate::headers::{is_content_header, split_header_line, HeaderCollection};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Request numbers are unique for the life of the process, across proxies.
static REQUEST_NUMBER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_request_number() -> u64 {
  REQUEST_NUMBER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Scheme a request arrived under: plain, or inside an intercepted TLS tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
  /// Plain HTTP, also used for the `CONNECT` request itself
  #[default]
  Http,
  /// HTTP read from a client TLS session terminated by the proxy
  Https,
}

impl Scheme {
  /// `http` or `https`
  pub fn as_str(&self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }
  /// `ws` or `wss`, the matching WebSocket scheme
  pub fn websocket(&self) -> &'static str {
    match self {
      Scheme::Http => "ws",
      Scheme::Https => "wss",
    }
  }
  /// Port implied when an authority carries none
  pub fn default_port(&self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }
}

impl Display for Scheme {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A request read from a client connection.
///
/// Observers receive it by mutable reference, so every field is public and any
/// change made before forwarding is what the origin sees.
#[derive(Clone)]
pub struct ClientRequest {
  /// Process-wide request number, shared with the matching response
  pub number: u64,
  /// Request method
  pub method: Method,
  /// Request-target exactly as sent, absolute or origin-form
  pub target: String,
  /// Protocol version from the request line
  pub version: Version,
  /// General headers
  pub headers: HeaderCollection,
  /// Headers describing the body
  pub content_headers: HeaderCollection,
  /// Captured body, already de-chunked
  pub body: Bytes,
  /// `https` once the request was read through an intercepted tunnel
  pub scheme: Scheme,
  /// Host without port or IPv6 brackets
  pub host: String,
  /// Destination port
  pub port: u16,
  /// Milliseconds since the Unix epoch when the head was parsed
  pub timestamp: u64,
}

impl Debug for ClientRequest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientRequest")
      .field("number", &self.number)
      .field("method", &self.method)
      .field("target", &self.target)
      .field("version", &self.version)
      .field("scheme", &self.scheme)
      .field("host", &self.host)
      .field("port", &self.port)
      .field("headers", &self.headers)
      .field("content_headers", &self.content_headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl ClientRequest {
  /// Create a request with no headers and no body.
  pub fn new(method: Method, target: impl Into<String>, version: Version) -> Self {
    ClientRequest {
      number: 0,
      method,
      target: target.into(),
      version,
      headers: HeaderCollection::new(),
      content_headers: HeaderCollection::new(),
      body: Bytes::new(),
      scheme: Scheme::Http,
      host: String::new(),
      port: Scheme::Http.default_port(),
      timestamp: crate::timestamp_millis(),
    }
  }

  /// Store a header in the general or content collection, by name.
  pub fn add_header(&mut self, name: &str, value: &str) {
    if is_content_header(name) {
      self.content_headers.add(name, value);
    } else {
      self.headers.add(name, value);
    }
  }

  /// First value of `name` from either collection.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get_first(name)
      .or_else(|| self.content_headers.get_first(name))
  }

  /// Returns true for `CONNECT`
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }

  /// Returns true when the client asked to switch protocols.
  pub fn is_upgrade(&self) -> bool {
    self.headers.contains("upgrade")
  }

  /// Returns true when the body arrives with chunked transfer coding.
  pub fn is_chunked(&self) -> bool {
    self.headers.get("transfer-encoding").is_some_and(|values| {
      values
        .iter()
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
    })
  }

  /// Whether a body is read when no length is announced.
  pub fn expects_body(&self) -> bool {
    !matches!(
      self.method,
      Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE | Method::CONNECT
    )
  }

  /// The announced `Content-Length`, if any.
  pub fn content_length(&self) -> Result<Option<usize>> {
    match self.content_headers.get_first("content-length") {
      Some(value) => Ok(Some(value.trim().parse::<usize>()?)),
      None => Ok(None),
    }
  }

  /// Change the scheme and recompute host and port.
  ///
  /// `fallback` is the authority of the enclosing `CONNECT` and is used when
  /// the request names no host of its own.
  pub(crate) fn set_scheme(&mut self, scheme: Scheme, fallback: Option<(&str, u16)>) {
    self.scheme = scheme;
    self.resolve_authority(fallback);
  }

  fn resolve_authority(&mut self, fallback: Option<(&str, u16)>) {
    let default_port = self.scheme.default_port();
    let (host, port) = if self.is_connect() {
      split_authority(&self.target, Scheme::Https.default_port())
    } else if let Some(uri) = absolute_uri(&self.target) {
      let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") | Some("wss") => 443,
        _ => 80,
      });
      let host = uri.host().unwrap_or_default();
      (strip_brackets(host).to_string(), port)
    } else if let Some(host) = self.headers.get_first("host") {
      split_authority(host, default_port)
    } else if let Some((host, port)) = fallback {
      (host.to_string(), port)
    } else {
      (String::new(), default_port)
    };
    self.host = host;
    self.port = port;
  }

  /// `host[:port]` with the port omitted when it is the scheme default.
  pub fn authority(&self) -> String {
    let host = if self.host.contains(':') {
      format!("[{}]", self.host)
    } else {
      self.host.clone()
    };
    if self.port == self.scheme.default_port() {
      host
    } else {
      format!("{}:{}", host, self.port)
    }
  }

  /// The URI the request is forwarded to.
  ///
  /// An absolute target is used as is. An origin-form target is combined with
  /// the scheme, host and port; its query is kept and any fragment dropped.
  pub fn effective_uri(&self) -> Result<http::Uri> {
    let target = strip_fragment(&self.target);
    if absolute_uri(target).is_some() {
      return Ok(http::Uri::try_from(target)?);
    }
    if self.host.is_empty() {
      return Err(Error::invalid_request(format!(
        "no host for request target {}",
        self.target
      )));
    }
    let path_and_query = if target.starts_with('/') {
      target.to_string()
    } else {
      format!("/{}", target)
    };
    let uri = http::Uri::builder()
      .scheme(self.scheme.as_str())
      .authority(self.authority())
      .path_and_query(path_and_query)
      .build()?;
    Ok(uri)
  }

  /// Render the request as HTTP/1.1 wire bytes.
  pub fn to_raw(&self) -> Bytes {
    let mut http_request = Vec::new();
    http_request.extend(self.method.as_str().as_bytes());
    http_request.extend(SPACE);
    http_request.extend(self.target.as_bytes());
    http_request.extend(SPACE);
    http_request.extend(version_str(self.version).as_bytes());
    http_request.extend(CR_LF);
    // 没有主机头就先补上
    if !self.headers.contains("host") && !self.host.is_empty() {
      http_request.extend(http::header::HOST.as_str().as_bytes());
      http_request.extend(COLON_SPACE);
      http_request.extend(self.authority().as_bytes());
      http_request.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    let mut content_headers = self.content_headers.clone();
    // the captured body is already de-chunked
    let chunked = headers.remove("transfer-encoding").is_some();
    if (chunked || !self.body.is_empty()) && !content_headers.contains("content-length") {
      content_headers.set("Content-Length", self.body.len().to_string());
    }
    headers.write_to(&mut http_request);
    content_headers.write_to(&mut http_request);
    http_request.extend(CR_LF);
    http_request.extend(self.body.as_ref());
    Bytes::from(http_request)
  }
}

/// Read a request line and headers.
///
/// Each line read is bounded by `read_timeout`. `Ok(None)` means the client sent
/// nothing, closed early, or stalled mid-head; the connection is simply closed.
/// A head larger than `max_header_bytes` or an unparsable line is an error.
pub async fn read_request_head<R>(
  reader: &mut R,
  read_timeout: Duration,
  max_header_bytes: usize,
) -> Result<Option<ClientRequest>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = HeadReader::new(read_timeout, max_header_bytes);
  let mut line = Vec::new();
  // tolerate blank lines ahead of the request line
  loop {
    if !head.next_line(reader, &mut line).await? {
      return Ok(None);
    }
    if !is_blank(&line) {
      break;
    }
  }
  let (method, target, version) = parse_request_line(&line)?;
  let mut request = ClientRequest::new(method, target, version);
  loop {
    if !head.next_line(reader, &mut line).await? {
      return Ok(None);
    }
    if is_blank(&line) {
      break;
    }
    let text = String::from_utf8_lossy(&line);
    match split_header_line(&text) {
      Some((name, value)) => request.add_header(name, value),
      None => {
        return Err(Error::invalid_request(format!(
          "malformed header line: {}",
          text.trim_end()
        )))
      }
    }
  }
  request.resolve_authority(None);
  Ok(Some(request))
}

/// Line reader shared by the request and response head parsers.
pub(crate) struct HeadReader {
  read_timeout: Duration,
  max_header_bytes: usize,
  total: usize,
}

impl HeadReader {
  pub(crate) fn new(read_timeout: Duration, max_header_bytes: usize) -> Self {
    HeadReader {
      read_timeout,
      max_header_bytes,
      total: 0,
    }
  }

  /// Replace `line` with the next line. Returns `false` on EOF, timeout or a
  /// line cut short.
  pub(crate) async fn next_line<R>(&mut self, reader: &mut R, line: &mut Vec<u8>) -> Result<bool>
  where
    R: AsyncBufRead + Unpin,
  {
    line.clear();
    let remaining = (self.max_header_bytes + 1).saturating_sub(self.total) as u64;
    let mut limited = (&mut *reader).take(remaining);
    let length = match tokio::time::timeout(self.read_timeout, limited.read_until(b'\n', line)).await
    {
      Ok(length) => length?,
      Err(_) => return Ok(false),
    };
    self.total += length;
    if self.total > self.max_header_bytes {
      return Err(Error::invalid_request(format!(
        "message head exceeds {} bytes",
        self.max_header_bytes
      )));
    }
    Ok(length > 0 && line.ends_with(b"\n"))
  }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version)> {
  let line = String::from_utf8_lossy(line);
  let mut parts = line.trim_end().splitn(3, ' ');
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request(format!(
      "malformed request line: {}",
      line.trim_end()
    )));
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", method)))?;
  if target.is_empty() {
    return Err(Error::invalid_request("empty request target"));
  }
  let version = parse_version(version.trim())
    .ok_or_else(|| Error::invalid_request(format!("invalid http version: {}", version)))?;
  Ok((method, target.to_string(), version))
}

pub(crate) fn parse_version(version: &str) -> Option<Version> {
  match version {
    "HTTP/0.9" => Some(Version::HTTP_09),
    "HTTP/1.0" => Some(Version::HTTP_10),
    "HTTP/1.1" => Some(Version::HTTP_11),
    "HTTP/2" | "HTTP/2.0" => Some(Version::HTTP_2),
    _ => None,
  }
}

/// Wire spelling; anything newer than 1.1 is written as 1.1.
pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_09 => "HTTP/0.9",
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

pub(crate) fn is_blank(line: &[u8]) -> bool {
  line == CR_LF || line == b"\n"
}

fn absolute_uri(target: &str) -> Option<http::Uri> {
  if !target.contains("://") {
    return None;
  }
  http::Uri::try_from(target)
    .ok()
    .filter(|uri| uri.scheme().is_some() && uri.authority().is_some())
}

fn strip_fragment(target: &str) -> &str {
  target.split('#').next().unwrap_or(target)
}

fn strip_brackets(host: &str) -> &str {
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
  let authority = authority.trim();
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
      return (host.to_string(), port);
    }
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(port) => (host.to_string(), port),
      Err(_) => (host.to_string(), default_port),
    },
    _ => (authority.to_string(), default_port),
  }
}
