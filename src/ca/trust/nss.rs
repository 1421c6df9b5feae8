use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::backend_common::{find_command, home_dir, require_success, run_command, tolerate_removal};
use super::TrustStore;

const STORE: &str = "nss";

/// NSS databases used by Firefox profiles and Chromium on Linux, managed with
/// the NSS `certutil`.
#[derive(Debug)]
pub(crate) struct NssTrustStore {
  certutil: PathBuf,
  databases: Vec<String>,
}

impl NssTrustStore {
  /// Detect NSS `certutil` and at least one database under the user's home
  pub(crate) fn detect() -> Option<Self> {
    // On Windows `certutil` is the OS tool, not the NSS one.
    if cfg!(windows) {
      return None;
    }
    let certutil = find_command("certutil")?;
    let databases = nss_databases(&home_dir()?);
    if databases.is_empty() {
      return None;
    }
    Some(Self {
      certutil,
      databases,
    })
  }

  fn for_each_db<F>(&self, mut f: F) -> Result<()>
  where
    F: FnMut(&str) -> Result<()>,
  {
    let mut failures = Vec::new();
    for db in &self.databases {
      if let Err(e) = f(db) {
        failures.push(format!("{}: {}", db, e));
      }
    }
    if failures.is_empty() {
      Ok(())
    } else {
      Err(Error::trust_store_error(STORE, failures.join("; ")))
    }
  }
}

/// Candidate profile roots relative to the home directory
fn profile_roots(home: &Path) -> Vec<PathBuf> {
  vec![
    home.join(".mozilla/firefox"),
    home.join("snap/firefox/common/.mozilla/firefox"),
    home.join("Library/Application Support/Firefox/Profiles"),
  ]
}

/// Every NSS database reachable from `home`, as `sql:`/`dbm:` specifiers.
pub(crate) fn nss_databases(home: &Path) -> Vec<String> {
  let mut dirs = vec![home.join(".pki/nssdb")];
  for root in profile_roots(home) {
    if let Ok(entries) = std::fs::read_dir(&root) {
      let mut profiles: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
      profiles.sort();
      dirs.extend(profiles);
    }
  }
  dirs
    .into_iter()
    .filter_map(|dir| {
      if dir.join("cert9.db").is_file() {
        Some(format!("sql:{}", dir.display()))
      } else if dir.join("cert8.db").is_file() {
        Some(format!("dbm:{}", dir.display()))
      } else {
        None
      }
    })
    .collect()
}

impl TrustStore for NssTrustStore {
  fn name(&self) -> &str {
    STORE
  }

  fn is_required(&self) -> bool {
    false
  }

  fn install(&self, cert_path: &Path, common_name: &str) -> Result<()> {
    self.for_each_db(|db| {
      let outcome = run_command(
        STORE,
        &self.certutil,
        [
          OsStr::new("-A"),
          OsStr::new("-d"),
          OsStr::new(db),
          OsStr::new("-t"),
          OsStr::new("C,,"),
          OsStr::new("-n"),
          OsStr::new(common_name),
          OsStr::new("-i"),
          cert_path.as_os_str(),
        ],
      )?;
      require_success(STORE, outcome)
    })
  }

  fn uninstall(&self, _cert_path: &Path, common_name: &str) -> Result<()> {
    self.for_each_db(|db| {
      let outcome = run_command(
        STORE,
        &self.certutil,
        ["-D", "-d", db, "-n", common_name],
      )?;
      tolerate_removal(STORE, outcome)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn finds_firefox_profiles_and_shared_db() {
    let home = std::env::temp_dir().join("netmiddler-test-nss-home");
    std::fs::remove_dir_all(&home).ok();
    let shared = home.join(".pki/nssdb");
    let modern = home.join(".mozilla/firefox/abcd.default-release");
    let legacy = home.join(".mozilla/firefox/efgh.old");
    let empty = home.join(".mozilla/firefox/ijkl.empty");
    for dir in [&shared, &modern, &legacy, &empty] {
      std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(shared.join("cert9.db"), b"").unwrap();
    std::fs::write(modern.join("cert9.db"), b"").unwrap();
    std::fs::write(legacy.join("cert8.db"), b"").unwrap();

    let dbs = nss_databases(&home);
    assert_eq!(
      dbs,
      vec![
        format!("sql:{}", shared.display()),
        format!("sql:{}", modern.display()),
        format!("dbm:{}", legacy.display()),
      ]
    );

    std::fs::remove_dir_all(&home).ok();
  }
}
