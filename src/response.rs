use std::fmt::{Debug, Formatter};
use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, Version};
use tokio::io::AsyncBufRead;

use crate::errors::{Error, Result};
use crate::headers::{is_content_header, split_header_line, HeaderCollection};
use crate::request::{is_blank, parse_version, version_str, HeadReader};
use crate::{CR_LF, SPACE};

/// A response relayed to the client.
///
/// Built from the origin's reply, or synthesized by the proxy itself for
/// `CONNECT` and WebSocket handshakes.
#[derive(Clone)]
pub struct ServerResponse {
  /// Number of the request this answers
  pub number: u64,
  /// Status code
  pub status: StatusCode,
  /// Reason phrase, written after the status code
  pub reason: String,
  /// Protocol version reported by the origin
  pub version: Version,
  /// General headers
  pub headers: HeaderCollection,
  /// Headers describing the body
  pub content_headers: HeaderCollection,
  /// Full response body
  pub body: Bytes,
  /// Milliseconds since the Unix epoch when the response was built
  pub timestamp: u64,
}

impl Debug for ServerResponse {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServerResponse")
      .field("number", &self.number)
      .field("status", &self.status)
      .field("reason", &self.reason)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("content_headers", &self.content_headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl ServerResponse {
  /// Create a response with the canonical reason phrase and no headers.
  pub fn new(number: u64, status: StatusCode) -> Self {
    ServerResponse {
      number,
      status,
      reason: status.canonical_reason().unwrap_or_default().to_string(),
      version: Version::HTTP_11,
      headers: HeaderCollection::new(),
      content_headers: HeaderCollection::new(),
      body: Bytes::new(),
      timestamp: crate::timestamp_millis(),
    }
  }

  /// The reply to a `CONNECT`, sent before the TLS handshake.
  pub fn connection_established(number: u64) -> Self {
    let mut response = ServerResponse::new(number, StatusCode::OK);
    response.reason = "Connection Established".to_string();
    response
  }

  /// Capture an origin response, reading its body to the end.
  pub(crate) async fn from_upstream(number: u64, upstream: reqwest::Response) -> Result<Self> {
    let status = upstream.status();
    let version = upstream.version();
    // only present when the origin sent a non-canonical phrase
    let reason = upstream
      .extensions()
      .get::<hyper::ext::ReasonPhrase>()
      .and_then(|phrase| std::str::from_utf8(phrase.as_bytes()).ok())
      .map(str::to_string)
      .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
    let (headers, content_headers) = HeaderCollection::split_header_map(upstream.headers());
    let body = upstream.bytes().await?;
    Ok(ServerResponse {
      number,
      status,
      reason,
      version,
      headers,
      content_headers,
      body,
      timestamp: crate::timestamp_millis(),
    })
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

  /// Prepare a captured response for a client that is disconnected afterwards.
  ///
  /// The body is already complete, so chunked coding is dropped in favour of
  /// an exact `Content-Length`, and `Connection: close` is forced.
  pub fn finalize_for_client(&mut self) {
    let chunked = self.headers.remove("transfer-encoding").is_some();
    self.headers.set("Connection", "close");
    if chunked || !self.content_headers.contains("content-length") {
      self
        .content_headers
        .set("Content-Length", self.body.len().to_string());
    }
  }

  /// Render the response as HTTP/1.1 wire bytes.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(version_str(self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status.as_str().as_bytes());
    if !self.reason.is_empty() {
      http_response.extend(SPACE);
      http_response.extend(self.reason.as_bytes());
    }
    http_response.extend(CR_LF);
    self.headers.write_to(&mut http_response);
    self.content_headers.write_to(&mut http_response);
    http_response.extend(CR_LF);
    http_response.extend(self.body.as_ref());
    Bytes::from(http_response)
  }
}

/// Parse a status line and headers back into a [`ServerResponse`].
///
/// The body is left unread in `reader`. Timeouts and truncation yield
/// `Ok(None)` the same way [`read_request_head`](crate::read_request_head) does.
pub async fn read_response_head<R>(
  reader: &mut R,
  read_timeout: Duration,
  max_header_bytes: usize,
) -> Result<Option<ServerResponse>>
where
  R: AsyncBufRead + Unpin,
{
  let mut head = HeadReader::new(read_timeout, max_header_bytes);
  let mut line = Vec::new();
  if !head.next_line(reader, &mut line).await? {
    return Ok(None);
  }
  let (version, status, reason) = parse_status_line(&line)?;
  let mut response = ServerResponse::new(0, status);
  response.version = version;
  response.reason = reason;
  loop {
    if !head.next_line(reader, &mut line).await? {
      return Ok(None);
    }
    if is_blank(&line) {
      break;
    }
    let text = String::from_utf8_lossy(&line);
    let (name, value) = split_header_line(&text)
      .ok_or_else(|| Error::invalid_request(format!("malformed header line: {}", text.trim_end())))?;
    response.add_header(name, value);
  }
  Ok(Some(response))
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String)> {
  let line = String::from_utf8_lossy(line);
  let line = line.trim_end();
  let mut parts = line.splitn(3, ' ');
  let version = parts
    .next()
    .and_then(parse_version)
    .ok_or_else(|| Error::invalid_request(format!("invalid status line: {}", line)))?;
  let status = parts
    .next()
    .ok_or_else(|| Error::invalid_request(format!("invalid status line: {}", line)))?;
  let status = StatusCode::from_bytes(status.as_bytes())
    .map_err(|x| Error::Http(http::Error::from(x)))?;
  let reason = parts.next().unwrap_or_default().to_string();
  Ok((version, status, reason))
}
