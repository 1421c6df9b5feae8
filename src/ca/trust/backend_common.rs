use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Captured result of an external trust tool
#[derive(Debug)]
pub(crate) struct CommandOutcome {
  pub success: bool,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutcome {
  /// stderr and stdout joined, for diagnostics
  pub fn output(&self) -> String {
    let mut text = self.stderr.trim().to_string();
    let stdout = self.stdout.trim();
    if !stdout.is_empty() {
      if !text.is_empty() {
        text.push('\n');
      }
      text.push_str(stdout);
    }
    text
  }
}

pub(crate) fn run_command<I, S>(store: &str, program: &Path, args: I) -> Result<CommandOutcome>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let output = Command::new(program).args(args).output().map_err(|error| {
    if error.kind() == io::ErrorKind::NotFound {
      return Error::trust_store_error(
        store,
        format!("command '{}' not found", program.display()),
      );
    }
    Error::trust_store_error(store, format!("{}: {}", program.display(), error))
  })?;

  let outcome = CommandOutcome {
    success: output.status.success(),
    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
  };
  tracing::debug!(
    "[TRUST] {} {} exited success={}",
    store,
    program.display(),
    outcome.success
  );
  Ok(outcome)
}

/// Fail unless the command succeeded
pub(crate) fn require_success(store: &str, outcome: CommandOutcome) -> Result<()> {
  if outcome.success {
    return Ok(());
  }
  Err(Error::trust_store_error(store, outcome.output()))
}

/// Accept a failed removal whose output only says the certificate is gone.
///
/// Several platform tools exit non-zero after deleting the last matching
/// certificate, or when asked to delete one that was already removed.
pub(crate) fn tolerate_removal(store: &str, outcome: CommandOutcome) -> Result<()> {
  if outcome.success {
    return Ok(());
  }
  let output = outcome.output();
  if reports_missing(&output) {
    tracing::warn!(
      "[TRUST] {} reported an error after removal, treating as removed: {}",
      store,
      output
    );
    return Ok(());
  }
  Err(Error::trust_store_error(store, output))
}

pub(crate) fn reports_missing(output: &str) -> bool {
  let lower = output.to_ascii_lowercase();
  lower.contains("could not find")
    || lower.contains("could not be found")
    || lower.contains("cannot find")
    || lower.contains("not found")
    || lower.contains("does not exist")
    || lower.contains("no such")
}

/// Locate an executable on PATH
pub(crate) fn find_command(program: &str) -> Option<PathBuf> {
  let path = std::env::var_os("PATH")?;
  std::env::split_paths(&path).find_map(|dir| {
    let candidate = dir.join(program);
    if candidate.is_file() {
      return Some(candidate);
    }
    if cfg!(windows) {
      let exe = dir.join(format!("{}.exe", program));
      if exe.is_file() {
        return Some(exe);
      }
    }
    None
  })
}

pub(crate) fn home_dir() -> Option<PathBuf> {
  let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
  std::env::var_os(var).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_certificate_phrases_are_recognized() {
    assert!(reports_missing(
      "SecTrustSettingsRemoveTrustSettings: The specified item could not be found in the keychain."
    ));
    assert!(reports_missing("CertUtil: -delstore command FAILED: Cannot find object or property."));
    assert!(reports_missing("keytool error: java.lang.Exception: Alias <netmiddler> does not exist"));
    assert!(!reports_missing("permission denied"));
  }

  #[test]
  fn tolerate_removal_only_accepts_missing() {
    let gone = CommandOutcome {
      success: false,
      stdout: String::new(),
      stderr: "certificate not found".into(),
    };
    assert!(tolerate_removal("test", gone).is_ok());

    let denied = CommandOutcome {
      success: false,
      stdout: String::new(),
      stderr: "access is denied".into(),
    };
    assert!(tolerate_removal("test", denied).is_err());
  }
}
