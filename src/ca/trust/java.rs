use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::backend_common::{require_success, run_command, tolerate_removal};
use super::TrustStore;

const STORE: &str = "java";
/// Default password of the JDK cacerts keystore
const STORE_PASS: &str = "changeit";

/// The cacerts keystore of the JDK named by `JAVA_HOME`
#[derive(Debug)]
pub(crate) struct JavaTrustStore {
  keytool: PathBuf,
  cacerts: PathBuf,
}

impl JavaTrustStore {
  /// Detect a JDK through `JAVA_HOME`
  pub(crate) fn detect() -> Option<Self> {
    let java_home = PathBuf::from(std::env::var_os("JAVA_HOME")?);
    let keytool_name = if cfg!(windows) {
      "keytool.exe"
    } else {
      "keytool"
    };
    let keytool = java_home.join("bin").join(keytool_name);
    if !keytool.is_file() {
      return None;
    }
    let cacerts = [
      java_home.join("lib/security/cacerts"),
      java_home.join("jre/lib/security/cacerts"),
    ]
    .into_iter()
    .find(|p| p.is_file())?;
    Some(Self { keytool, cacerts })
  }
}

fn alias(common_name: &str) -> String {
  common_name.to_ascii_lowercase()
}

impl TrustStore for JavaTrustStore {
  fn name(&self) -> &str {
    STORE
  }

  fn is_required(&self) -> bool {
    false
  }

  fn install(&self, cert_path: &Path, common_name: &str) -> Result<()> {
    let alias = alias(common_name);
    let outcome = run_command(
      STORE,
      &self.keytool,
      [
        OsStr::new("-importcert"),
        OsStr::new("-noprompt"),
        OsStr::new("-keystore"),
        self.cacerts.as_os_str(),
        OsStr::new("-storepass"),
        OsStr::new(STORE_PASS),
        OsStr::new("-file"),
        cert_path.as_os_str(),
        OsStr::new("-alias"),
        OsStr::new(&alias),
      ],
    )?;
    require_success(STORE, outcome)
  }

  fn uninstall(&self, _cert_path: &Path, common_name: &str) -> Result<()> {
    let alias = alias(common_name);
    let outcome = run_command(
      STORE,
      &self.keytool,
      [
        OsStr::new("-delete"),
        OsStr::new("-alias"),
        OsStr::new(&alias),
        OsStr::new("-keystore"),
        self.cacerts.as_os_str(),
        OsStr::new("-storepass"),
        OsStr::new(STORE_PASS),
      ],
    )?;
    tolerate_removal(STORE, outcome)
  }
}
