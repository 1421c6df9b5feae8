use std::path::Path;

use crate::error::{Error, Result};

use super::TrustStore;

#[derive(Debug, Default)]
pub(crate) struct PlatformTrustStore;

impl TrustStore for PlatformTrustStore {
  fn name(&self) -> &str {
    "system"
  }

  fn is_required(&self) -> bool {
    true
  }

  fn install(&self, _cert_path: &Path, _common_name: &str) -> Result<()> {
    Err(Error::trust_store_error(
      "system",
      "installing a root is not supported on this platform",
    ))
  }

  fn uninstall(&self, _cert_path: &Path, _common_name: &str) -> Result<()> {
    Ok(())
  }
}
