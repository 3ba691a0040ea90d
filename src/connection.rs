use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::errors::{new_io_error, Error, Result};
use crate::request::{is_blank, read_request_head, ClientRequest, Scheme};
use crate::response::ServerResponse;
use crate::socket::{MaybeTlsStream, Socket};

const READ_CHUNK: usize = 8 * 1024;

/// Per-connection context: the client transport and what crossed it.
///
/// Created when a socket is accepted and dropped when the connection closes.
#[derive(Debug)]
pub struct ConnectionState {
  id: u64,
  peer_addr: SocketAddr,
  local_addr: SocketAddr,
  reader: BufReader<Socket>,
  read_timeout: Duration,
  max_header_bytes: usize,
  tunnel: Option<(String, u16)>,
  requests: Vec<ClientRequest>,
  responses: Vec<ServerResponse>,
}

impl ConnectionState {
  pub(crate) fn new(
    id: u64,
    stream: TcpStream,
    read_timeout: Duration,
    max_header_bytes: usize,
  ) -> Result<Self> {
    let peer_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let socket = Socket::new(
      MaybeTlsStream::Tcp(stream),
      Some(read_timeout),
      Some(read_timeout),
    );
    Ok(ConnectionState {
      id,
      peer_addr,
      local_addr,
      reader: BufReader::new(socket),
      read_timeout,
      max_header_bytes,
      tunnel: None,
      requests: Vec::new(),
      responses: Vec::new(),
    })
  }

  /// Connection number
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Client address
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }

  /// Listener address the client reached
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Returns true once the client transport is TLS
  pub fn is_tls(&self) -> bool {
    self.reader.get_ref().is_tls()
  }

  /// Requests read on this connection, oldest first
  pub fn requests(&self) -> &[ClientRequest] {
    &self.requests
  }

  /// Responses written on this connection, oldest first
  pub fn responses(&self) -> &[ServerResponse] {
    &self.responses
  }

  /// Read the next request head.
  ///
  /// Inside a tunnel the request is marked `https` and inherits the tunnel's
  /// host when it names none itself.
  pub(crate) async fn read_request(&mut self) -> Result<Option<ClientRequest>> {
    let request =
      read_request_head(&mut self.reader, self.read_timeout, self.max_header_bytes).await?;
    let Some(mut request) = request else {
      return Ok(None);
    };
    if self.is_tls() {
      let fallback = self
        .tunnel
        .as_ref()
        .map(|(host, port)| (host.as_str(), *port));
      request.set_scheme(Scheme::Https, fallback);
    }
    Ok(Some(request))
  }

  /// Read the body announced by the request head.
  ///
  /// A read that stalls for longer than the read timeout ends the body early;
  /// whatever arrived so far is kept and forwarded.
  pub(crate) async fn read_body(&mut self, request: &mut ClientRequest) -> Result<()> {
    let body = if let Some(length) = request.content_length()? {
      self.read_exact_or_stall(length, request.number).await?
    } else if request.is_chunked() {
      self.read_chunked(request.number).await?
    } else if request.expects_body() {
      self.read_until_idle().await?
    } else {
      Bytes::new()
    };
    request.body = body;
    Ok(())
  }

  async fn read_exact_or_stall(&mut self, length: usize, number: u64) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(length.min(1024 * 1024));
    let mut buffer = vec![0u8; READ_CHUNK];
    while body.len() < length {
      let want = (length - body.len()).min(READ_CHUNK);
      match tokio::time::timeout(self.read_timeout, self.reader.read(&mut buffer[..want])).await {
        Ok(Ok(0)) => {
          tracing::warn!(
            connection_id = self.id,
            request_number = number,
            expected = length,
            received = body.len(),
            "client closed before the full body arrived"
          );
          break;
        }
        Ok(Ok(n)) => body.extend_from_slice(&buffer[..n]),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
          tracing::warn!(
            connection_id = self.id,
            request_number = number,
            expected = length,
            received = body.len(),
            "body read stalled, forwarding partial body"
          );
          break;
        }
      }
    }
    Ok(body.freeze())
  }

  async fn read_until_idle(&mut self) -> Result<Bytes> {
    let mut body = BytesMut::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
      match tokio::time::timeout(self.read_timeout, self.reader.read(&mut buffer)).await {
        Ok(Ok(0)) | Err(_) => break,
        Ok(Ok(n)) => body.extend_from_slice(&buffer[..n]),
        Ok(Err(e)) => return Err(e.into()),
      }
    }
    Ok(body.freeze())
  }

  async fn read_chunked(&mut self, number: u64) -> Result<Bytes> {
    let mut body = BytesMut::new();
    let mut line = Vec::new();
    loop {
      if !self.read_line(&mut line).await? {
        tracing::warn!(
          connection_id = self.id,
          request_number = number,
          received = body.len(),
          "chunked body stalled, forwarding partial body"
        );
        return Ok(body.freeze());
      }
      let text = String::from_utf8_lossy(&line);
      let size = text.trim().split(';').next().unwrap_or_default().trim();
      if size.is_empty() {
        continue;
      }
      let size = usize::from_str_radix(size, 16)?;
      if size == 0 {
        // trailers
        while self.read_line(&mut line).await? && !is_blank(&line) {}
        return Ok(body.freeze());
      }
      let chunk = self.read_exact_or_stall(size, number).await?;
      let complete = chunk.len() == size;
      body.extend_from_slice(&chunk);
      if !complete {
        return Ok(body.freeze());
      }
      // CRLF after the chunk data
      if !self.read_line(&mut line).await? {
        return Ok(body.freeze());
      }
    }
  }

  /// Returns false on EOF or timeout.
  async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<bool> {
    line.clear();
    match tokio::time::timeout(self.read_timeout, self.reader.read_until(b'\n', line)).await {
      Ok(Ok(0)) | Err(_) => Ok(false),
      Ok(Ok(_)) => Ok(true),
      Ok(Err(e)) => Err(e.into()),
    }
  }

  /// Terminate TLS on this connection for the tunnel to `host:port`.
  pub(crate) async fn upgrade_to_tls(self, acceptor: TlsAcceptor, host: &str, port: u16) -> Result<Self> {
    let ConnectionState {
      id,
      peer_addr,
      local_addr,
      reader,
      read_timeout,
      max_header_bytes,
      requests,
      responses,
      ..
    } = self;
    if !reader.buffer().is_empty() {
      return Err(Error::invalid_request(
        "client sent data before the tunnel was established",
      ));
    }
    let mut socket = reader
      .into_inner()
      .upgrade(acceptor)
      .await
      .map_err(|e| Error::tls_error(format!("client handshake failed: {}", e)))?;
    socket.set_timeouts(Some(read_timeout));
    Ok(ConnectionState {
      id,
      peer_addr,
      local_addr,
      reader: BufReader::new(socket),
      read_timeout,
      max_header_bytes,
      tunnel: Some((host.to_string(), port)),
      requests,
      responses,
    })
  }

  pub(crate) fn record_request(&mut self, request: &ClientRequest) {
    self.requests.push(request.clone());
  }

  /// Write `response` and remember it.
  pub(crate) async fn write_response(&mut self, response: &ServerResponse) -> Result<()> {
    let socket = self.reader.get_mut();
    socket.write_all(&response.to_raw()).await?;
    socket.flush().await?;
    self.responses.push(response.clone());
    Ok(())
  }

  /// Hand the transport over, e.g. to a WebSocket bridge.
  pub(crate) fn into_socket(self) -> Result<Socket> {
    if !self.reader.buffer().is_empty() {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "unexpected data after upgrade request",
      ));
    }
    Ok(self.reader.into_inner())
  }

  /// Flush and shut the write side down, ignoring failures.
  pub(crate) async fn close(&mut self) {
    let socket = self.reader.get_mut();
    if let Err(e) = socket.shutdown().await {
      tracing::trace!(connection_id = self.id, error = %e, "shutdown");
    }
  }
}
