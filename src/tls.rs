//! rustls configuration for both legs of an intercepted session
//!
//! The client-facing leg presents a host certificate minted by
//! [`CertificateManager`](crate::CertificateManager). The origin-facing
//! WebSocket leg accepts whatever certificate the origin presents.
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, ServerConfig, SignatureScheme,
};

use crate::errors::{Error, Result};

/// Only HTTP/1.1 is spoken on either leg.
const ALPN_HTTP1: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Server configuration presenting `chain` (leaf first) without client auth.
pub(crate) fn server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::tls_error(format!("invalid host certificate: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(Arc::new(config))
}

/// Client configuration that skips origin certificate validation.
pub(crate) fn insecure_client_config() -> Result<Arc<ClientConfig>> {
  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(Arc::new(config))
}

/// Parse a server name for SNI, falling back to an IP literal.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_string())
    .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_names_accept_hosts_and_ips() {
    assert!(server_name("example.com").is_ok());
    assert!(matches!(
      server_name("127.0.0.1").unwrap(),
      ServerName::IpAddress(_)
    ));
    assert!(server_name("bad host").is_err());
  }

  #[test]
  fn insecure_client_speaks_http1_only() {
    let config = insecure_client_config().unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }
}
