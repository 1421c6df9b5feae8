//! Trust store installation of the root certificate
//!
//! The operating system store is mandatory: a root that clients do not trust
//! makes every intercepted handshake fail. Java and NSS (Firefox) stores are
//! populated best-effort when present.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

mod backend_common;
mod java;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
mod nss;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod unsupported;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use linux::PlatformTrustStore;
#[cfg(target_os = "macos")]
use macos::PlatformTrustStore;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
use unsupported::PlatformTrustStore;
#[cfg(target_os = "windows")]
use windows::PlatformTrustStore;

/// A certificate store that can be told to trust or distrust the root
pub trait TrustStore: Send + Sync {
  /// Short store name used in logs and errors
  fn name(&self) -> &str;

  /// Whether an install failure must abort startup
  fn is_required(&self) -> bool;

  /// Trust the certificate at `cert_path`
  fn install(&self, cert_path: &Path, common_name: &str) -> Result<()>;

  /// Remove trust for the certificate at `cert_path`
  fn uninstall(&self, cert_path: &Path, common_name: &str) -> Result<()>;
}

/// Every store detected on this machine
pub fn system_stores() -> Vec<Arc<dyn TrustStore>> {
  let mut stores: Vec<Arc<dyn TrustStore>> = vec![Arc::new(PlatformTrustStore)];
  if let Some(java) = java::JavaTrustStore::detect() {
    tracing::debug!("[TRUST] Java keystore detected");
    stores.push(Arc::new(java));
  }
  if let Some(nss) = nss::NssTrustStore::detect() {
    tracing::debug!("[TRUST] NSS databases detected");
    stores.push(Arc::new(nss));
  }
  stores
}

/// Install into each store. Required stores propagate failure, others warn.
pub fn install_all(stores: &[Arc<dyn TrustStore>], cert_path: &Path, common_name: &str) -> Result<()> {
  for store in stores {
    match store.install(cert_path, common_name) {
      Ok(()) => tracing::info!("[TRUST] Root installed into {} store", store.name()),
      Err(e) if store.is_required() => return Err(e),
      Err(e) => tracing::warn!("[TRUST] Skipping {} store: {}", store.name(), e),
    }
  }
  Ok(())
}

/// Remove from every store, downgrading all failures to warnings.
pub fn uninstall_all(stores: &[Arc<dyn TrustStore>], cert_path: &Path, common_name: &str) {
  for store in stores {
    match store.uninstall(cert_path, common_name) {
      Ok(()) => tracing::info!("[TRUST] Root removed from {} store", store.name()),
      Err(e) => tracing::warn!("[TRUST] Removing root from {} store failed: {}", store.name(), e),
    }
  }
}

/// Store that records trust in memory
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
  name: String,
  required: bool,
  fail_install: bool,
  trusted: Mutex<Vec<Vec<u8>>>,
  installs: Mutex<usize>,
}

impl MemoryTrustStore {
  /// A required store that accepts every certificate
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      required: true,
      ..Default::default()
    }
  }

  /// A best-effort store
  pub fn optional(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      required: false,
      ..Default::default()
    }
  }

  /// Make every install fail
  pub fn failing(mut self) -> Self {
    self.fail_install = true;
    self
  }

  /// Number of certificates currently trusted
  pub fn trusted_count(&self) -> usize {
    self.trusted.lock().map(|t| t.len()).unwrap_or(0)
  }

  /// Whether exactly this PEM certificate is trusted
  pub fn trusts(&self, cert_pem: &str) -> bool {
    self
      .trusted
      .lock()
      .map(|t| t.iter().any(|c| c == cert_pem.as_bytes()))
      .unwrap_or(false)
  }

  /// Number of successful install calls
  pub fn install_count(&self) -> usize {
    self.installs.lock().map(|n| *n).unwrap_or(0)
  }
}

impl TrustStore for MemoryTrustStore {
  fn name(&self) -> &str {
    &self.name
  }

  fn is_required(&self) -> bool {
    self.required
  }

  fn install(&self, cert_path: &Path, _common_name: &str) -> Result<()> {
    if self.fail_install {
      return Err(Error::trust_store_error(&self.name, "install rejected"));
    }
    let cert = std::fs::read(cert_path)?;
    let mut trusted = self
      .trusted
      .lock()
      .map_err(|_| Error::trust_store_error(&self.name, "lock poisoned"))?;
    if !trusted.contains(&cert) {
      trusted.push(cert);
    }
    if let Ok(mut n) = self.installs.lock() {
      *n += 1;
    }
    Ok(())
  }

  fn uninstall(&self, cert_path: &Path, _common_name: &str) -> Result<()> {
    let cert = std::fs::read(cert_path)?;
    let mut trusted = self
      .trusted
      .lock()
      .map_err(|_| Error::trust_store_error(&self.name, "lock poisoned"))?;
    trusted.retain(|c| c != &cert);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn optional_store_failure_is_not_fatal() {
    let dir = std::env::temp_dir().join("netmiddler-test-trust-optional");
    std::fs::create_dir_all(&dir).unwrap();
    let cert = dir.join("root.pem");
    std::fs::write(&cert, b"root").unwrap();

    let system = Arc::new(MemoryTrustStore::new("system"));
    let stores: Vec<Arc<dyn TrustStore>> = vec![
      system.clone(),
      Arc::new(MemoryTrustStore::optional("java").failing()),
    ];
    install_all(&stores, &cert, "root").unwrap();
    assert!(system.trusts("root"));

    let required: Vec<Arc<dyn TrustStore>> = vec![Arc::new(MemoryTrustStore::new("system").failing())];
    let err = install_all(&required, &cert, "root").unwrap_err();
    assert!(err.is_setup());

    std::fs::remove_dir_all(&dir).ok();
  }
}
