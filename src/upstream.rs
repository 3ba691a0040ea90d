use std::time::Duration;

use http::HeaderMap;
use reqwest::redirect::Policy;

use crate::errors::Result;
use crate::request::ClientRequest;

/// Headers the proxy recomputes or that only concern the client-proxy hop.
const NOT_FORWARDED: &[&str] = &["content-length", "transfer-encoding", "proxy-connection"];

/// The shared outbound HTTP client.
///
/// It never uses a proxy itself, never follows redirects (the client sees
/// them), and pools connections across all intercepted clients.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamClient {
  client: reqwest::Client,
}

impl UpstreamClient {
  pub(crate) fn new(timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
    let client = reqwest::Client::builder()
      .no_proxy()
      .redirect(Policy::none())
      .danger_accept_invalid_certs(accept_invalid_certs)
      .timeout(timeout)
      .http1_only()
      .build()?;
    Ok(UpstreamClient { client })
  }

  /// Send `request` to its origin and return the response head; the body is
  /// still unread.
  pub(crate) async fn forward(&self, request: &ClientRequest) -> Result<reqwest::Response> {
    let uri = request.effective_uri()?;
    let mut headers = HeaderMap::new();
    request.headers.append_to(&mut headers)?;
    request.content_headers.append_to(&mut headers)?;
    for name in NOT_FORWARDED {
      headers.remove(*name);
    }
    let mut builder = self
      .client
      .request(request.method.clone(), uri.to_string())
      .headers(headers);
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }
    tracing::debug!(
      request_number = request.number,
      method = %request.method,
      uri = %uri,
      "forwarding"
    );
    Ok(builder.send().await?)
  }
}
