//! Certificate authority tests

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use capture_proxy::CertificateManager;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

fn storage(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(name);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn san_entries(der: &[u8]) -> (Vec<String>, Vec<IpAddr>) {
  let (_, cert) = parse_x509_certificate(der).unwrap();
  let san = cert
    .subject_alternative_name()
    .unwrap()
    .expect("no subject alternative name");
  let mut dns = Vec::new();
  let mut ips = Vec::new();
  for name in &san.value.general_names {
    match name {
      GeneralName::DNSName(host) => dns.push(host.to_string()),
      GeneralName::IPAddress(bytes) => match bytes.len() {
        4 => ips.push(IpAddr::from(<[u8; 4]>::try_from(*bytes).unwrap())),
        16 => ips.push(IpAddr::from(<[u8; 16]>::try_from(*bytes).unwrap())),
        _ => panic!("bad ip SAN"),
      },
      _ => {}
    }
  }
  (dns, ips)
}

#[tokio::test]
async fn host_certificates_are_signed_by_the_root() {
  let manager = CertificateManager::new(storage("capture-proxy-ca-signing"), "Signing Test CA", false);
  let root = manager.ensure_root_certificate().await.unwrap();
  let (_, root_cert) = parse_x509_certificate(root.der().as_ref()).unwrap();
  assert!(root_cert.is_ca());
  assert_eq!(root.common_name(), "Signing Test CA");
  assert!(root.not_before() < ::time::OffsetDateTime::now_utc() - ::time::Duration::days(300));

  let first = manager.get_certificate_for_host("a.test:443").await.unwrap();
  let second = manager.get_certificate_for_host("b.test").await.unwrap();
  assert!(!Arc::ptr_eq(&first, &second));
  assert_ne!(first.serial(), second.serial());
  assert_eq!(first.serial().len(), 20);

  for (certificate, host) in [(&first, "a.test"), (&second, "b.test")] {
    let (dns, _) = san_entries(certificate.der().as_ref());
    assert_eq!(dns, vec![host.to_string()]);
    let (_, leaf) = parse_x509_certificate(certificate.der().as_ref()).unwrap();
    assert_eq!(leaf.issuer().to_string(), root_cert.subject().to_string());
    assert!(!leaf.is_ca());
    assert!(certificate.not_after() <= root.not_after());
    assert_eq!(certificate.chain().len(), 2);
  }
}

fn rsa_bits(der: &[u8]) -> usize {
  let (_, cert) = parse_x509_certificate(der).unwrap();
  match cert.public_key().parsed().unwrap() {
    x509_parser::public_key::PublicKey::RSA(rsa) => rsa.key_size(),
    _ => panic!("expected an RSA key"),
  }
}

#[tokio::test]
async fn root_and_host_keys_are_rsa() {
  let manager = CertificateManager::new(storage("capture-proxy-ca-rsa"), "RSA Test CA", false);
  let root = manager.ensure_root_certificate().await.unwrap();
  assert_eq!(rsa_bits(root.der().as_ref()), 4096);
  let leaf = manager.get_certificate_for_host("rsa.test").await.unwrap();
  assert_eq!(rsa_bits(leaf.der().as_ref()), 2048);
}

#[tokio::test]
async fn repeated_requests_share_one_certificate() {
  let manager = CertificateManager::new(storage("capture-proxy-ca-cache"), "Cache Test CA", false);
  let first = manager.get_certificate_for_host("Example.test").await.unwrap();
  let again = manager.get_certificate_for_host("example.test:8443").await.unwrap();
  assert!(Arc::ptr_eq(&first, &again));
  assert_eq!(manager.issued_count(), 1);
}

#[tokio::test]
async fn concurrent_requests_issue_once() {
  let manager = Arc::new(CertificateManager::new(
    storage("capture-proxy-ca-concurrent"),
    "Concurrent Test CA",
    false,
  ));
  manager.ensure_root_certificate().await.unwrap();

  let tasks: Vec<_> = (0..16)
    .map(|_| {
      let manager = manager.clone();
      tokio::spawn(async move { manager.get_certificate_for_host("a.com").await.unwrap() })
    })
    .collect();
  let mut results = Vec::new();
  for task in tasks {
    results.push(task.await.unwrap());
  }
  assert_eq!(manager.issued_count(), 1);
  assert!(results.iter().all(|c| Arc::ptr_eq(c, &results[0])));
}

#[tokio::test]
async fn ip_literal_gets_ip_san() {
  let manager = CertificateManager::new(storage("capture-proxy-ca-ip"), "IP Test CA", false);
  let certificate = manager.get_certificate_for_host("127.0.0.1:8443").await.unwrap();
  assert_eq!(certificate.host(), "127.0.0.1");
  let (_, ips) = san_entries(certificate.der().as_ref());
  assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
async fn root_is_exported_and_reloaded() {
  let dir = storage("capture-proxy-ca-export");
  let export = dir.join("export");
  let manager = CertificateManager::new(&dir, "Export Test CA", true);
  let (der_path, pem_path) = manager.export_root_certificate(&export).await.unwrap();
  assert_eq!(der_path, export.join("export-test-ca.cer"));
  assert_eq!(pem_path, export.join("export-test-ca.pem"));

  let root = manager.ensure_root_certificate().await.unwrap();
  assert_eq!(std::fs::read(&der_path).unwrap(), root.der().as_ref());
  let pem = std::fs::read_to_string(&pem_path).unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"));

  let issued = manager.get_certificate_for_host("persisted.test").await.unwrap();
  assert!(dir.join("hosts").join("persisted.test.pem").exists());

  // a second manager finds both on disk
  let reopened = CertificateManager::new(&dir, "Export Test CA", true);
  let reloaded = reopened.ensure_root_certificate().await.unwrap();
  assert_eq!(reloaded.der(), root.der());
  let reused = reopened.get_certificate_for_host("persisted.test").await.unwrap();
  assert_eq!(reused.der(), issued.der());
  assert_eq!(reopened.issued_count(), 0);

  reopened.remove_root_certificate().await;
  assert!(!dir.join("root").join("export-test-ca.pem").exists());
  assert!(!dir.join("hosts").exists());
  // removing twice is harmless
  reopened.remove_root_certificate().await;
  reopened.remove_host_certificates().await;
}
