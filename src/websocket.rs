//! WebSocket bridging
//!
//! An upgrade request is answered by opening a second WebSocket to the origin,
//! completing the client handshake by hand, and then pumping messages in both
//! directions until either side closes.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionState;
use crate::errors::{Error, Result};
use crate::request::{ClientRequest, Scheme};
use crate::response::ServerResponse;
use crate::tls;

/// Headers carried from the client handshake to the origin handshake.
const FORWARDED: &[&str] = &["authorization", "sec-websocket-protocol"];

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`: the Base64 SHA-1
/// of the key followed by the RFC 6455 GUID.
pub fn accept_key(key: &str) -> String {
  derive_accept_key(key.trim().as_bytes())
}

/// Frames relayed in each direction by one bridge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayCounts {
  /// Messages sent by the client and delivered to the origin
  pub client_to_origin: u64,
  /// Messages sent by the origin and delivered to the client
  pub origin_to_client: u64,
}

/// Bridge an upgrade request to the origin; the connection is consumed.
pub(crate) async fn bridge(
  connection: ConnectionState,
  request: &ClientRequest,
  connect_timeout: Duration,
  token: CancellationToken,
) -> Result<RelayCounts> {
  let addr = (request.host.as_str(), request.port);
  let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await??;
  match request.scheme {
    Scheme::Http => handshake_and_relay(connection, request, tcp, connect_timeout, token).await,
    Scheme::Https => {
      let connector = TlsConnector::from(tls::insecure_client_config()?);
      let server_name = tls::server_name(&request.host)?;
      let stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
        .await??;
      handshake_and_relay(connection, request, stream, connect_timeout, token).await
    }
  }
}

async fn handshake_and_relay<S>(
  mut connection: ConnectionState,
  request: &ClientRequest,
  origin: S,
  connect_timeout: Duration,
  token: CancellationToken,
) -> Result<RelayCounts>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let key = request
    .header("sec-websocket-key")
    .ok_or_else(|| Error::invalid_request("upgrade request without Sec-WebSocket-Key"))?
    .to_string();

  let mut origin_request = origin_uri(request)?.into_client_request()?;
  for name in FORWARDED {
    if let Some(value) = request.header(name) {
      origin_request
        .headers_mut()
        .insert(*name, http::HeaderValue::from_str(value)?);
    }
  }
  let (origin_ws, origin_response) =
    tokio::time::timeout(connect_timeout, tokio_tungstenite::client_async(origin_request, origin))
      .await??;
  let protocol = origin_response
    .headers()
    .get("sec-websocket-protocol")
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);

  let response = switching_protocols(request.number, &key, protocol.as_deref());
  connection.write_response(&response).await?;
  let connection_id = connection.id();
  let socket = connection.into_socket()?;
  let client_ws = WebSocketStream::from_raw_socket(socket, Role::Server, None).await;
  tracing::debug!(
    connection_id,
    request_number = request.number,
    host = %request.host,
    "websocket established"
  );
  relay(client_ws, origin_ws, token).await
}

/// The hand-written `101` sent to the client.
pub(crate) fn switching_protocols(number: u64, key: &str, protocol: Option<&str>) -> ServerResponse {
  let mut response = ServerResponse::new(number, StatusCode::SWITCHING_PROTOCOLS);
  response.add_header("Upgrade", "websocket");
  response.add_header("Connection", "Upgrade");
  response.add_header("Sec-WebSocket-Accept", &accept_key(key));
  if let Some(protocol) = protocol {
    response.add_header("Sec-WebSocket-Protocol", protocol);
  }
  response
}

fn origin_uri(request: &ClientRequest) -> Result<http::Uri> {
  let effective = request.effective_uri()?;
  let path = effective
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let uri = http::Uri::builder()
    .scheme(request.scheme.websocket())
    .authority(request.authority())
    .path_and_query(path)
    .build()?;
  Ok(uri)
}

/// Pump messages both ways until a close, an error, or cancellation.
pub(crate) async fn relay<C, O>(
  client: WebSocketStream<C>,
  origin: WebSocketStream<O>,
  token: CancellationToken,
) -> Result<RelayCounts>
where
  C: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  let token = token.child_token();
  let (client_tx, client_rx) = client.split();
  let (origin_tx, origin_rx) = origin.split();
  let (upstream, downstream) = tokio::join!(
    pump(client_rx, origin_tx, token.clone()),
    pump(origin_rx, client_tx, token.clone()),
  );
  Ok(RelayCounts {
    client_to_origin: upstream?,
    origin_to_client: downstream?,
  })
}

async fn pump<R, W>(mut source: R, mut sink: W, token: CancellationToken) -> Result<u64>
where
  R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  W: Sink<Message, Error = WsError> + Unpin,
{
  let mut relayed = 0;
  let result = loop {
    let next = tokio::select! {
      _ = token.cancelled() => break Ok(()),
      next = source.next() => next,
    };
    match next {
      Some(Ok(Message::Close(frame))) => {
        // same status and reason on the other side
        if let Err(e) = sink.send(Message::Close(frame)).await {
          tracing::trace!(error = %e, "close propagation");
        }
        break Ok(());
      }
      Some(Ok(message)) => match sink.send(message).await {
        Ok(()) => relayed += 1,
        Err(e) => break Err(e),
      },
      Some(Err(e)) => break Err(e),
      None => break Ok(()),
    }
  };
  token.cancel();
  match result {
    Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(relayed),
    Err(e) => Err(e.into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{Method, Version};

  #[test]
  fn accept_key_matches_rfc_vector() {
    assert_eq!(
      accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }

  #[test]
  fn switching_protocols_echoes_subprotocol() {
    let response = switching_protocols(4, "dGhlIHNhbXBsZSBub25jZQ==", Some("chat"));
    let raw = response.to_raw();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[test]
  fn origin_uri_uses_websocket_scheme() {
    let mut request = ClientRequest::new(Method::GET, "/socket?room=1", Version::HTTP_11);
    request.set_scheme(Scheme::Https, Some(("chat.test", 443)));
    assert_eq!(
      origin_uri(&request).unwrap().to_string(),
      "wss://chat.test/socket?room=1"
    );
    request.set_scheme(Scheme::Http, Some(("chat.test", 8080)));
    assert_eq!(
      origin_uri(&request).unwrap().to_string(),
      "ws://chat.test:8080/socket?room=1"
    );
  }

  #[tokio::test]
  async fn close_is_propagated_with_reason() {
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    let (client_near, client_far) = tokio::io::duplex(4096);
    let (origin_near, origin_far) = tokio::io::duplex(4096);
    let client_side = WebSocketStream::from_raw_socket(client_near, Role::Server, None).await;
    let origin_side = WebSocketStream::from_raw_socket(origin_near, Role::Client, None).await;
    let mut client = WebSocketStream::from_raw_socket(client_far, Role::Client, None).await;
    let mut origin = WebSocketStream::from_raw_socket(origin_far, Role::Server, None).await;

    let token = CancellationToken::new();
    let bridge = tokio::spawn(relay(client_side, origin_side, token));

    client.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(origin.next().await.unwrap().unwrap(), Message::Text("hello".into()));
    origin.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(client.next().await.unwrap().unwrap(), Message::Binary(vec![1, 2, 3]));

    client
      .send(Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "bye".into(),
      })))
      .await
      .unwrap();
    match origin.next().await.unwrap().unwrap() {
      Message::Close(Some(frame)) => {
        assert_eq!(frame.code, CloseCode::Away);
        assert_eq!(frame.reason, "bye");
      }
      other => panic!("expected close, got {other:?}"),
    }
    let counts = bridge.await.unwrap().unwrap();
    assert_eq!(counts.client_to_origin, 1);
    assert_eq!(counts.origin_to_client, 1);
  }
}
