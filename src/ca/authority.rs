//! Root certificate authority credential
//!
//! Generates, persists and reloads the self-signed root used to sign every
//! leaf certificate the proxy presents to clients.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SerialNumber,
};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::CertificateDer;
use x509_parser::parse_x509_certificate;

/// Root certificate file name
pub const ROOT_CERT_FILE: &str = "netmiddler-ca.pem";
/// Root private key file name
pub const ROOT_KEY_FILE: &str = "netmiddler-ca-key.pem";
/// Subject common name of the root
pub const ROOT_COMMON_NAME: &str = "DO_NOT_TRUST_NetMiddlerRoot";
/// Subject organization of the root
pub const ROOT_ORGANIZATION: &str = "DO_NOT_TRUST_NetMiddler";
/// Root validity in days (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Locations of the two persisted root files
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootPaths {
  /// PEM certificate, world readable
  pub cert: PathBuf,
  /// PEM PKCS#8 private key, owner only
  pub key: PathBuf,
}

impl RootPaths {
  /// Paths inside the given storage directory
  pub fn in_dir(dir: impl AsRef<Path>) -> Self {
    let dir = dir.as_ref();
    Self {
      cert: dir.join(ROOT_CERT_FILE),
      key: dir.join(ROOT_KEY_FILE),
    }
  }
}

/// The self-signed root signing credential
pub struct RootCredential {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  serial_number: Vec<u8>,
  organization: String,
  common_name: String,
}

impl std::fmt::Debug for RootCredential {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RootCredential")
      .field("common_name", &self.common_name)
      .field("organization", &self.organization)
      .field("not_before", &self.not_before)
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

impl RootCredential {
  /// Generate a fresh root valid for ten years
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
    ];
    let serial: u64 = rand::thread_rng().gen();
    params.serial_number = Some(SerialNumber::from(serial));

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate root key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to self-sign root: {}", e)))?;

    let cert_pem = cert.pem();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;
    Self::assemble(issuer, cert_der, cert_pem)
  }

  /// Rebuild a root from its PEM certificate and PEM private key
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse root key: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in root PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;
    Self::assemble(issuer, cert_der, cert_pem.to_string())
  }

  fn assemble(
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
  ) -> Result<Self> {
    let fields = RootFields::from_der(&cert_der)?;
    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
      not_before: fields.not_before,
      not_after: fields.not_after,
      serial_number: fields.serial_number,
      organization: fields
        .organization
        .unwrap_or_else(|| ROOT_ORGANIZATION.to_string()),
      common_name: fields
        .common_name
        .unwrap_or_else(|| ROOT_COMMON_NAME.to_string()),
    })
  }

  /// Load the root from disk
  pub async fn load(paths: &RootPaths) -> Result<Self> {
    let cert_pem = fs::read_to_string(&paths.cert).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", paths.cert.display(), e))
    })?;
    let key_pem = fs::read_to_string(&paths.key).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", paths.key.display(), e))
    })?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Write the certificate (0644) and key (0600) to disk, replacing any
  /// previous files.
  pub async fn persist(&self, paths: &RootPaths) -> Result<()> {
    for path in [&paths.cert, &paths.key] {
      if let Some(parent) = path.parent() {
        create_private_dir(parent).await?;
      }
      match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::certificate_error(format!("{}: {}", path.display(), e))),
      }
    }
    write_with_mode(&paths.cert, self.cert_pem.as_bytes(), 0o644).await?;
    write_with_mode(&paths.key, self.issuer.key().serialize_pem().as_bytes(), 0o600).await?;
    tracing::info!("[CA] Root written to {}", paths.cert.display());
    Ok(())
  }

  /// Signing issuer used for leaf certificates
  pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
    &self.issuer
  }

  /// Root certificate in DER form
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Root certificate in PEM form
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  pub fn serial_number(&self) -> &[u8] {
    &self.serial_number
  }

  pub fn organization(&self) -> &str {
    &self.organization
  }

  pub fn common_name(&self) -> &str {
    &self.common_name
  }
}

/// Fields read back from an encoded root certificate
pub(crate) struct RootFields {
  pub not_before: OffsetDateTime,
  pub not_after: OffsetDateTime,
  pub serial_number: Vec<u8>,
  pub organization: Option<String>,
  pub common_name: Option<String>,
}

impl RootFields {
  pub(crate) fn from_der(der: &[u8]) -> Result<Self> {
    let (_, cert) = parse_x509_certificate(der)
      .map_err(|e| Error::certificate_error(format!("Failed to parse root certificate: {}", e)))?;
    let validity = cert.validity();
    let subject = cert.subject();
    let fields = Self {
      not_before: validity.not_before.to_datetime(),
      not_after: validity.not_after.to_datetime(),
      serial_number: cert.raw_serial().to_vec(),
      organization: subject
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string),
      common_name: subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string),
    };
    Ok(fields)
  }

  /// Parse the first certificate of a PEM document
  pub(crate) fn from_pem(pem: &str) -> Result<Self> {
    let der = rustls_pemfile::certs(&mut pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in root PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;
    Self::from_der(&der)
  }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
  if fs::metadata(dir).await.is_ok() {
    return Ok(());
  }
  let mut builder = std::fs::DirBuilder::new();
  builder.recursive(true);
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(0o700);
  }
  builder
    .create(dir)
    .map_err(|e| Error::certificate_error(format!("Failed to create {}: {}", dir.display(), e)))
}

async fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
  let mut options = fs::OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  options.mode(mode);
  #[cfg(not(unix))]
  let _ = mode;
  let mut file = options
    .open(path)
    .await
    .map_err(|e| Error::certificate_error(format!("Failed to create {}: {}", path.display(), e)))?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_root_is_marked_untrusted() {
    let root = RootCredential::generate().unwrap();
    assert_eq!(root.common_name(), ROOT_COMMON_NAME);
    assert!(root.common_name().starts_with("DO_NOT_TRUST_"));
    assert!(root.cert_pem().contains("BEGIN CERTIFICATE"));
    assert!(!root.serial_number().is_empty());
    let lifetime = root.not_after() - root.not_before();
    assert!(lifetime >= Duration::days(ROOT_VALIDITY_DAYS));
  }

  #[test]
  fn fields_are_read_from_the_encoded_certificate() {
    let root = RootCredential::generate().unwrap();
    let fields = RootFields::from_pem(root.cert_pem()).unwrap();
    assert_eq!(fields.common_name.as_deref(), Some(ROOT_COMMON_NAME));
    assert_eq!(fields.organization.as_deref(), Some(ROOT_ORGANIZATION));
    assert!(fields.not_before < OffsetDateTime::now_utc());
    assert!(fields.not_after > OffsetDateTime::now_utc() + Duration::days(ROOT_VALIDITY_DAYS - 1));
    assert!(RootFields::from_pem("not a certificate").is_err());
  }

  #[tokio::test]
  async fn persisted_root_reloads_identically() {
    let dir = std::env::temp_dir().join("netmiddler-test-root-persist");
    std::fs::remove_dir_all(&dir).ok();
    let paths = RootPaths::in_dir(&dir);

    let root = RootCredential::generate().unwrap();
    root.persist(&paths).await.unwrap();
    let loaded = RootCredential::load(&paths).await.unwrap();

    assert_eq!(loaded.cert_der(), root.cert_der());
    assert_eq!(loaded.common_name(), ROOT_COMMON_NAME);
    assert_eq!(loaded.organization(), ROOT_ORGANIZATION);
    assert_eq!(loaded.not_before(), root.not_before());
    assert_eq!(loaded.not_after(), root.not_after());
    assert_eq!(loaded.serial_number(), root.serial_number());

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let mode = std::fs::metadata(&paths.key).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o600, "private key must be owner-only");
    }

    std::fs::remove_dir_all(&dir).ok();
  }
}
