use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Lower bound on the handshake deadline.
const HANDSHAKE_FLOOR: Duration = Duration::from_secs(5);

/// A client transport: the accepted TCP stream, or the TLS session the proxy
/// terminated on top of it.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

/// Plain or TLS-wrapped client stream.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS terminated by the proxy
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// The TCP stream underneath, TLS or not
  pub fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

impl Socket {
  pub(crate) fn new(
    inner: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Socket {
      inner,
      read_timeout,
      write_timeout,
    }
  }

  /// Run the server side of a TLS handshake over the plain stream.
  ///
  /// A socket that is already TLS is returned untouched.
  pub(crate) async fn upgrade(self, acceptor: TlsAcceptor) -> io::Result<Self> {
    let Socket {
      inner,
      read_timeout,
      write_timeout,
    } = self;
    let inner = match inner {
      MaybeTlsStream::Tcp(tcp) => {
        let deadline = read_timeout.map(|t| t.max(HANDSHAKE_FLOOR));
        let tls = with_deadline(deadline, acceptor.accept(tcp)).await?;
        MaybeTlsStream::Tls(Box::new(tls))
      }
      tls => tls,
    };
    Ok(Socket::new(inner, read_timeout, write_timeout))
  }

  /// Replace both timeouts.
  pub(crate) fn set_timeouts(&mut self, timeout: Option<Duration>) {
    self.read_timeout = timeout;
    self.write_timeout = timeout;
  }

  /// Returns true once the TLS handshake completed.
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }

  /// Address of the connected client.
  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    self.inner.tcp().peer_addr()
  }

  /// Address the client connected to.
  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.tcp().local_addr()
  }

  /// Write the whole buffer within the write timeout.
  pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
    with_deadline(self.write_timeout, self.inner.write_all(buf)).await
  }

  /// Flush within the write timeout.
  pub async fn flush(&mut self) -> io::Result<()> {
    with_deadline(self.write_timeout, self.inner.flush()).await
  }

  /// Shut the write side down within the write timeout; for TLS this sends
  /// `close_notify` first.
  pub async fn shutdown(&mut self) -> io::Result<()> {
    with_deadline(self.write_timeout, self.inner.shutdown()).await
  }
}

async fn with_deadline<F, T>(deadline: Option<Duration>, operation: F) -> io::Result<T>
where
  F: Future<Output = io::Result<T>>,
{
  match deadline {
    None => operation.await,
    Some(deadline) => tokio::time::timeout(deadline, operation).await?,
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
