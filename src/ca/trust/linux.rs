use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::backend_common::{find_command, require_success, run_command, tolerate_removal};
use super::TrustStore;

const STORE: &str = "system";

/// Debian/Ubuntu style anchor, refreshed by `update-ca-certificates`
const DEBIAN_ANCHOR: &str = "/usr/local/share/ca-certificates/netmiddler-ca.crt";
/// Fedora/RHEL style anchor, refreshed by `update-ca-trust`
const REDHAT_ANCHOR: &str = "/etc/pki/ca-trust/source/anchors/netmiddler-ca.pem";

#[derive(Debug)]
enum Tool {
  UpdateCaCertificates(PathBuf),
  UpdateCaTrust(PathBuf),
  /// p11-kit `trust anchor`
  P11Trust(PathBuf),
}

/// The distribution CA bundle
#[derive(Debug, Default)]
pub(crate) struct PlatformTrustStore;

impl PlatformTrustStore {
  fn tool(&self) -> Result<Tool> {
    if let Some(path) = find_command("update-ca-certificates") {
      return Ok(Tool::UpdateCaCertificates(path));
    }
    if let Some(path) = find_command("update-ca-trust") {
      return Ok(Tool::UpdateCaTrust(path));
    }
    if let Some(path) = find_command("trust") {
      return Ok(Tool::P11Trust(path));
    }
    Err(Error::trust_store_error(
      STORE,
      "no supported CA tool found (update-ca-certificates, update-ca-trust, trust)",
    ))
  }
}

impl TrustStore for PlatformTrustStore {
  fn name(&self) -> &str {
    STORE
  }

  fn is_required(&self) -> bool {
    true
  }

  fn install(&self, cert_path: &Path, _common_name: &str) -> Result<()> {
    match self.tool()? {
      Tool::UpdateCaCertificates(tool) => {
        copy_anchor(cert_path, &anchor_path(DEBIAN_ANCHOR))?;
        require_success(STORE, run_command(STORE, &tool, ["--fresh"])?)
      }
      Tool::UpdateCaTrust(tool) => {
        copy_anchor(cert_path, &anchor_path(REDHAT_ANCHOR))?;
        require_success(STORE, run_command(STORE, &tool, ["extract"])?)
      }
      Tool::P11Trust(tool) => {
        let outcome = run_command(
          STORE,
          &tool,
          [OsStr::new("anchor"), OsStr::new("--store"), cert_path.as_os_str()],
        )?;
        require_success(STORE, outcome)
      }
    }
  }

  fn uninstall(&self, cert_path: &Path, _common_name: &str) -> Result<()> {
    match self.tool()? {
      Tool::UpdateCaCertificates(tool) => {
        remove_anchor(&anchor_path(DEBIAN_ANCHOR))?;
        tolerate_removal(STORE, run_command(STORE, &tool, ["--fresh"])?)
      }
      Tool::UpdateCaTrust(tool) => {
        remove_anchor(&anchor_path(REDHAT_ANCHOR))?;
        tolerate_removal(STORE, run_command(STORE, &tool, ["extract"])?)
      }
      Tool::P11Trust(tool) => {
        let outcome = run_command(
          STORE,
          &tool,
          [OsStr::new("anchor"), OsStr::new("--remove"), cert_path.as_os_str()],
        )?;
        tolerate_removal(STORE, outcome)
      }
    }
  }
}

fn anchor_path(default: &str) -> PathBuf {
  match std::env::var_os("NETMIDDLER_LINUX_CA_PATH") {
    Some(path) => PathBuf::from(path),
    None => PathBuf::from(default),
  }
}

fn copy_anchor(cert_path: &Path, anchor: &Path) -> Result<()> {
  if let Some(parent) = anchor.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| Error::trust_store_error(STORE, format!("{}: {}", parent.display(), e)))?;
  }
  std::fs::copy(cert_path, anchor)
    .map(|_| ())
    .map_err(|e| Error::trust_store_error(STORE, format!("{}: {}", anchor.display(), e)))
}

fn remove_anchor(anchor: &Path) -> Result<()> {
  match std::fs::remove_file(anchor) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(Error::trust_store_error(
      STORE,
      format!("{}: {}", anchor.display(), e),
    )),
  }
}
