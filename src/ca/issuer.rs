//! On-demand leaf certificates for intercepted hosts

use crate::ca::authority::RootCredential;
use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::string::Ia5String;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
  KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Leaves never outlive the root minus this margin
const ROOT_EXPIRY_MARGIN: Duration = Duration::hours(1);
/// Upper bound of the renewal margin
const MAX_RENEWAL_MARGIN: Duration = Duration::hours(1);

/// A per-host certificate and key, signed by the root
pub struct LeafCredential {
  hostname: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  issued_at: OffsetDateTime,
  expires_at: OffsetDateTime,
  server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for LeafCredential {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCredential")
      .field("hostname", &self.hostname)
      .field("issued_at", &self.issued_at)
      .field("expires_at", &self.expires_at)
      .finish_non_exhaustive()
  }
}

impl LeafCredential {
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  pub fn issued_at(&self) -> OffsetDateTime {
    self.issued_at
  }

  pub fn expires_at(&self) -> OffsetDateTime {
    self.expires_at
  }

  /// TLS server configuration presenting this credential, HTTP/1.1 only
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }

  fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
    now + margin < self.expires_at
  }
}

/// Issues and caches leaf credentials keyed by hostname.
///
/// Concurrent requests for the same uncached host share one signing
/// operation; different hosts are signed independently.
pub struct LeafIssuer {
  root: Arc<RootCredential>,
  lifetime: Duration,
  cache: Cache<String, Arc<LeafCredential>>,
  issued: Arc<AtomicU64>,
}

impl LeafIssuer {
  /// Create an issuer signing with `root`
  pub fn new(root: Arc<RootCredential>, lifetime: std::time::Duration, capacity: u64) -> Self {
    let cache = Cache::builder()
      .max_capacity(capacity)
      .time_to_live(lifetime)
      .build();
    Self {
      root,
      lifetime: Duration::try_from(lifetime).unwrap_or(Duration::days(7)),
      cache,
      issued: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Root this issuer signs with
  pub fn root(&self) -> &Arc<RootCredential> {
    &self.root
  }

  /// Number of certificates signed so far
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// Return the cached credential for `hostname`, signing a new one when it
  /// is missing or about to expire. Failures are not cached.
  pub async fn issue(&self, hostname: &str) -> Result<Arc<LeafCredential>> {
    let host = normalize_host(hostname)?;

    if let Some(cached) = self.cache.get(&host).await {
      if cached.is_fresh(OffsetDateTime::now_utc(), self.renewal_margin()) {
        return Ok(cached);
      }
      tracing::debug!("[CA] Leaf for {} expired, reissuing", host);
      self.cache.invalidate(&host).await;
    }

    let root = self.root.clone();
    let lifetime = self.lifetime;
    let issued = self.issued.clone();
    let name = host.clone();
    self
      .cache
      .try_get_with(host, async move {
        let credential = tokio::task::spawn_blocking(move || sign_leaf(&root, &name, lifetime))
          .await
          .map_err(|e| Error::CertificateError(format!("Signing task failed: {}", e)))??;
        issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("[CA] Issued leaf for {}", credential.hostname);
        Ok::<_, Error>(Arc::new(credential))
      })
      .await
      .map_err(|e: Arc<Error>| Error::CertificateError(e.to_string()))
  }

  fn renewal_margin(&self) -> Duration {
    let tenth = self.lifetime / 10_i32;
    if tenth > MAX_RENEWAL_MARGIN {
      MAX_RENEWAL_MARGIN
    } else {
      tenth
    }
  }
}

/// Lowercase, drop a trailing dot and IPv6 brackets.
fn normalize_host(hostname: &str) -> Result<String> {
  let host = hostname
    .trim()
    .trim_end_matches('.')
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_ascii_lowercase();
  if host.is_empty() {
    return Err(Error::invalid_request("empty hostname"));
  }
  Ok(host)
}

fn truncate_to_seconds(t: OffsetDateTime) -> OffsetDateTime {
  t - Duration::nanoseconds(t.nanosecond() as i64)
}

fn sign_leaf(root: &RootCredential, host: &str, lifetime: Duration) -> Result<LeafCredential> {
  let mut params = CertificateParams::default();
  let serial: u64 = rand::thread_rng().gen();
  params.serial_number = Some(SerialNumber::from(serial));

  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, host);
  params.distinguished_name = dn;

  let dns_name: Ia5String = host
    .try_into()
    .map_err(|_| Error::certificate_error(format!("Invalid domain name: {}", host)))?;
  params.subject_alt_names = match host.parse::<IpAddr>() {
    // Some clients match IP literals against dNSName entries.
    Ok(ip) => vec![SanType::IpAddress(ip), SanType::DnsName(dns_name)],
    Err(_) => vec![SanType::DnsName(dns_name)],
  };
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

  let now = truncate_to_seconds(OffsetDateTime::now_utc());
  let not_before = (now - Duration::seconds(NOT_BEFORE_OFFSET)).max(root.not_before());
  let not_after = (now + lifetime).min(truncate_to_seconds(root.not_after() - ROOT_EXPIRY_MARGIN));
  if not_after <= now {
    return Err(Error::certificate_error(format!(
      "Root expires too soon to issue a leaf for {}",
      host
    )));
  }
  params.not_before = not_before;
  params.not_after = not_after;

  let key_pair = KeyPair::generate()
    .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
  let cert = params
    .signed_by(&key_pair, root.issuer())
    .map_err(|e| Error::certificate_error(format!("Failed to sign leaf for {}: {}", host, e)))?;

  let cert_chain = vec![
    CertificateDer::from(cert.der().to_vec()),
    root.cert_der().clone(),
  ];
  let key = PrivateKeyDer::try_from(key_pair.serialize_der())
    .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;

  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let mut server_config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(cert_chain.clone(), key.clone_key())
    .map_err(|e| Error::tls_error(format!("Invalid leaf for {}: {}", host, e)))?;
  server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

  Ok(LeafCredential {
    hostname: host.to_string(),
    cert_chain,
    key,
    issued_at: now,
    expires_at: not_after,
    server_config: Arc::new(server_config),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostnames_are_normalized() {
    assert_eq!(normalize_host("Example.COM.").unwrap(), "example.com");
    assert_eq!(normalize_host("[::1]").unwrap(), "::1");
    assert!(normalize_host("  ").is_err());
  }

  #[test]
  fn leaf_stays_inside_root_window() {
    let root = RootCredential::generate().unwrap();
    let leaf = sign_leaf(&root, "example.com", Duration::days(36500)).unwrap();
    assert!(leaf.expires_at() <= root.not_after() - ROOT_EXPIRY_MARGIN);
    assert!(leaf.issued_at() <= leaf.expires_at());
    assert_eq!(leaf.cert_chain().len(), 2);
  }

  #[tokio::test]
  async fn ip_literal_gets_credential() {
    let root = Arc::new(RootCredential::generate().unwrap());
    let issuer = LeafIssuer::new(root, std::time::Duration::from_secs(3600), 16);
    let leaf = issuer.issue("127.0.0.1").await.unwrap();
    assert_eq!(leaf.hostname(), "127.0.0.1");

    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.cert_chain()[0]).unwrap();
    let sans = cert.subject_alternative_name().unwrap().unwrap();
    let mut has_ip = false;
    let mut has_dns = false;
    for name in &sans.value.general_names {
      match name {
        x509_parser::extensions::GeneralName::IPAddress(bytes) => has_ip |= *bytes == [127, 0, 0, 1],
        x509_parser::extensions::GeneralName::DNSName(dns) => has_dns |= *dns == "127.0.0.1",
        _ => {}
      }
    }
    assert!(has_ip && has_dns, "expected IP and DNS entries, got {:?}", sans.value.general_names);
  }
}
