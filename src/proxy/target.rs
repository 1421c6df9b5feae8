//! Destination of a proxied connection

use crate::error::{Error, Result};
use http::uri::Authority;
use std::fmt;

/// Host and port a client asked to reach
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
  /// Hostname or IP literal, IPv6 without brackets
  pub host: String,
  pub port: u16,
}

impl Target {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Parse `host`, `host:port` or `[v6]:port`
  pub fn parse(authority: &str, default_port: u16) -> Result<Self> {
    let parsed: Authority = authority
      .trim()
      .parse()
      .map_err(|e| Error::invalid_request(format!("invalid target '{}': {}", authority, e)))?;
    if parsed.as_str().contains('@') {
      return Err(Error::invalid_request(format!(
        "credentials are not allowed in target '{}'",
        authority
      )));
    }
    let has_port = !parsed.as_str().ends_with(']') && parsed.as_str().contains(':');
    if has_port && parsed.port_u16().is_none() {
      return Err(Error::invalid_request(format!("invalid port in '{}'", authority)));
    }
    let host = parsed.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
      return Err(Error::invalid_request(format!("missing host in '{}'", authority)));
    }
    Ok(Self::new(host, parsed.port_u16().unwrap_or(default_port)))
  }

  /// `host:port` suitable for DNS resolution and logging
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.authority())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_connect_targets() {
    assert_eq!(
      Target::parse("example.com:443", 443).unwrap(),
      Target::new("example.com", 443)
    );
    assert_eq!(
      Target::parse("example.com", 80).unwrap(),
      Target::new("example.com", 80)
    );
    let v6 = Target::parse("[::1]:8443", 443).unwrap();
    assert_eq!(v6.host, "::1");
    assert_eq!(v6.authority(), "[::1]:8443");
  }

  #[test]
  fn rejects_garbage() {
    assert!(Target::parse("", 443).is_err());
    assert!(Target::parse("user:pw@example.com:443", 443).is_err());
    assert!(Target::parse("example.com:notaport", 443).is_err());
  }
}
