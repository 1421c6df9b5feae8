use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::backend_common::{home_dir, require_success, run_command, tolerate_removal};
use super::TrustStore;

const STORE: &str = "system";
const SECURITY: &str = "/usr/bin/security";

/// The login keychain with an explicit trustRoot setting
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
    let keychain = login_keychain_path()?;
    let outcome = run_command(
      STORE,
      Path::new(SECURITY),
      [
        OsStr::new("add-trusted-cert"),
        OsStr::new("-r"),
        OsStr::new("trustRoot"),
        OsStr::new("-k"),
        keychain.as_os_str(),
        cert_path.as_os_str(),
      ],
    )?;
    require_success(STORE, outcome)
  }

  fn uninstall(&self, cert_path: &Path, common_name: &str) -> Result<()> {
    let outcome = run_command(
      STORE,
      Path::new(SECURITY),
      [OsStr::new("remove-trusted-cert"), cert_path.as_os_str()],
    )?;
    tolerate_removal(STORE, outcome)?;

    let keychain = login_keychain_path()?;
    let outcome = run_command(
      STORE,
      Path::new(SECURITY),
      [
        OsStr::new("delete-certificate"),
        OsStr::new("-c"),
        OsStr::new(common_name),
        keychain.as_os_str(),
      ],
    )?;
    tolerate_removal(STORE, outcome)
  }
}

fn login_keychain_path() -> Result<PathBuf> {
  let Some(home) = home_dir() else {
    return Err(Error::trust_store_error(
      STORE,
      "HOME is not set; cannot resolve the login keychain",
    ));
  };
  Ok(home.join("Library/Keychains/login.keychain-db"))
}
