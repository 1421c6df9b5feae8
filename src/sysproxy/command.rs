use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Run a configuration tool and return its stdout, failing on non-zero exit
#[cfg_attr(target_os = "windows", allow(dead_code))]
pub(crate) fn run(program: &str, args: &[&str]) -> Result<String> {
  let output = Command::new(program)
    .args(args)
    .output()
    .map_err(|e| Error::system_proxy_error(format!("{}: {}", program, e)))?;
  if !output.status.success() {
    return Err(Error::system_proxy_error(format!(
      "{} {} failed: {}",
      program,
      args.join(" "),
      String::from_utf8_lossy(&output.stderr).trim()
    )));
  }
  Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a tool feeding `input` on stdin
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn run_with_input(program: &str, args: &[&str], input: &str) -> Result<()> {
  let mut child = Command::new(program)
    .args(args)
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|e| Error::system_proxy_error(format!("{}: {}", program, e)))?;
  if let Some(mut stdin) = child.stdin.take() {
    stdin
      .write_all(input.as_bytes())
      .map_err(|e| Error::system_proxy_error(format!("{} stdin: {}", program, e)))?;
  }
  let output = child
    .wait_with_output()
    .map_err(|e| Error::system_proxy_error(format!("{}: {}", program, e)))?;
  if !output.status.success() {
    return Err(Error::system_proxy_error(format!(
      "{} failed: {}",
      program,
      String::from_utf8_lossy(&output.stderr).trim()
    )));
  }
  Ok(())
}
