use std::ffi::OsStr;
use std::path::Path;

use crate::error::Result;

use super::backend_common::{require_success, run_command, tolerate_removal};
use super::TrustStore;

const STORE: &str = "system";

/// The current user's Root store, managed through `certutil`
#[derive(Debug, Default)]
pub(crate) struct PlatformTrustStore;

impl TrustStore for PlatformTrustStore {
  fn name(&self) -> &str {
    STORE
  }

  fn is_required(&self) -> bool {
    true
  }

  fn install(&self, cert_path: &Path, _common_name: &str) -> Result<()> {
    let outcome = run_command(
      STORE,
      Path::new("certutil"),
      [
        OsStr::new("-user"),
        OsStr::new("-f"),
        OsStr::new("-addstore"),
        OsStr::new("Root"),
        cert_path.as_os_str(),
      ],
    )?;
    require_success(STORE, outcome)
  }

  fn uninstall(&self, _cert_path: &Path, common_name: &str) -> Result<()> {
    let outcome = run_command(
      STORE,
      Path::new("certutil"),
      ["-user", "-delstore", "Root", common_name],
    )?;
    tolerate_removal(STORE, outcome)
  }
}
