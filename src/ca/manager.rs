//! Root lifecycle: create, persist, trust and uninstall

use crate::ca::authority::{RootCredential, RootFields, RootPaths, ROOT_COMMON_NAME};
use crate::ca::trust::{self, TrustStore};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// What `CaManager::ensure` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
  /// Both root files were already present
  Existing,
  /// A new root was generated, persisted and trusted
  Created,
  /// The root was removed from trust stores and disk
  Uninstalled,
}

/// Owns the persisted root and its trust store registrations
pub struct CaManager {
  paths: RootPaths,
  stores: Vec<Arc<dyn TrustStore>>,
}

impl CaManager {
  /// Manager over an explicit set of trust stores
  pub fn new(storage_path: impl AsRef<Path>, stores: Vec<Arc<dyn TrustStore>>) -> Self {
    Self {
      paths: RootPaths::in_dir(storage_path),
      stores,
    }
  }

  /// Manager over the stores detected on this machine
  pub fn with_system_stores(storage_path: impl AsRef<Path>) -> Self {
    Self::new(storage_path, trust::system_stores())
  }

  pub fn paths(&self) -> &RootPaths {
    &self.paths
  }

  /// Path of the public root certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.paths.cert.clone()
  }

  /// Make sure a trusted root exists, or with `uninstall` remove it entirely.
  ///
  /// Without `uninstall` this is idempotent: when both files are present
  /// nothing is touched. Generation, persistence and installation into the
  /// operating system store are fatal on failure. Uninstall always succeeds
  /// once the files are deleted; trust store complaints are logged.
  pub async fn ensure(&self, uninstall: bool) -> Result<EnsureOutcome> {
    if uninstall {
      return self.uninstall().await;
    }

    let cert_exists = exists(&self.paths.cert).await;
    let key_exists = exists(&self.paths.key).await;
    if cert_exists && key_exists {
      tracing::debug!("[CA] Using existing root at {}", self.paths.cert.display());
      return Ok(EnsureOutcome::Existing);
    }
    if cert_exists {
      tracing::warn!(
        "[CA] {} has no private key, replacing the root",
        self.paths.cert.display()
      );
      let common_name = self.stale_common_name().await;
      self.untrust(common_name).await?;
    }

    let root = tokio::task::spawn_blocking(RootCredential::generate)
      .await
      .map_err(|e| Error::certificate_error(format!("Root generation task failed: {}", e)))??;
    root.persist(&self.paths).await?;

    let stores = self.stores.clone();
    let cert_path = self.paths.cert.clone();
    let common_name = root.common_name().to_string();
    let installed = tokio::task::spawn_blocking(move || {
      trust::install_all(&stores, &cert_path, &common_name)
    })
    .await
    .map_err(|e| Error::trust_store_error("system", format!("install task failed: {}", e)))?;

    if let Err(e) = installed {
      // Leave no untrusted root behind, so the next start retries the install.
      self.remove_files().await?;
      return Err(e);
    }
    tracing::info!("[CA] Created root {}", root.common_name());
    Ok(EnsureOutcome::Created)
  }

  /// Load the persisted root
  pub async fn load(&self) -> Result<RootCredential> {
    RootCredential::load(&self.paths).await
  }

  async fn uninstall(&self) -> Result<EnsureOutcome> {
    if exists(&self.paths.cert).await {
      let common_name = self.stale_common_name().await;
      self.untrust(common_name).await?;
    } else {
      tracing::info!("[CA] No root certificate at {}", self.paths.cert.display());
    }
    self.remove_files().await?;
    tracing::info!("[CA] Root uninstalled");
    Ok(EnsureOutcome::Uninstalled)
  }

  async fn stale_common_name(&self) -> String {
    let pem = match fs::read_to_string(&self.paths.cert).await {
      Ok(pem) => pem,
      Err(_) => return ROOT_COMMON_NAME.to_string(),
    };
    RootFields::from_pem(&pem)
      .ok()
      .and_then(|fields| fields.common_name)
      .unwrap_or_else(|| ROOT_COMMON_NAME.to_string())
  }

  async fn untrust(&self, common_name: String) -> Result<()> {
    let stores = self.stores.clone();
    let cert_path = self.paths.cert.clone();
    tokio::task::spawn_blocking(move || trust::uninstall_all(&stores, &cert_path, &common_name))
      .await
      .map_err(|e| Error::trust_store_error("system", format!("uninstall task failed: {}", e)))
  }

  async fn remove_files(&self) -> Result<()> {
    for path in [&self.paths.cert, &self.paths.key] {
      match fs::remove_file(path).await {
        Ok(()) => tracing::debug!("[CA] Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          return Err(Error::certificate_error(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
          )))
        }
      }
    }
    Ok(())
  }
}

async fn exists(path: &Path) -> bool {
  fs::metadata(path).await.is_ok()
}
