//! Proxy configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Environment variable overriding the CA storage directory
pub const HOME_ENV: &str = "NETMIDDLER_HOME";
/// Default listen port
pub const DEFAULT_PORT: u16 = 8888;

/// How the proxy validates certificates presented by real upstream servers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UpstreamVerification {
  /// Validate against the bundled web PKI roots plus any extra roots
  #[default]
  Strict,
  /// Accept any upstream certificate
  Insecure,
}

/// Configuration for the MITM proxy
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// Host the listener binds to
  pub listen_host: String,
  /// Port the listener binds to
  pub listen_port: u16,
  /// Directory holding the root certificate and key
  pub ca_storage_path: PathBuf,
  /// Log request and response heads
  pub print_headers: bool,
  /// Log decrypted payload bytes
  pub print_body: bool,
  /// Upstream certificate policy
  pub upstream_verification: UpstreamVerification,
  /// Additional roots trusted for upstream connections
  pub extra_upstream_roots: Vec<CertificateDer<'static>>,
  /// Upstream dial timeout
  pub connect_timeout: Duration,
  /// Timeout for each TLS handshake
  pub handshake_timeout: Duration,
  /// Validity of issued leaf certificates
  pub leaf_lifetime: Duration,
  /// Maximum number of cached leaf credentials
  pub cert_cache_capacity: u64,
  /// Grace period for in-flight connections during shutdown
  pub drain_timeout: Duration,
  /// Redirect the operating system's traffic to the listener
  pub system_proxy: bool,
  /// Upstream port for TLS connections redirected without CONNECT
  pub transparent_upstream_port: u16,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen_host: "127.0.0.1".to_string(),
      listen_port: DEFAULT_PORT,
      ca_storage_path: default_storage_path(),
      print_headers: false,
      print_body: false,
      upstream_verification: UpstreamVerification::Strict,
      extra_upstream_roots: Vec::new(),
      connect_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(10),
      leaf_lifetime: Duration::from_secs(7 * 24 * 60 * 60),
      cert_cache_capacity: 1000,
      drain_timeout: Duration::from_secs(5),
      system_proxy: true,
      transparent_upstream_port: 443,
    }
  }
}

impl MitmConfig {
  /// Set the listen port
  pub fn with_port(mut self, port: u16) -> Self {
    self.listen_port = port;
    self
  }

  /// Set the CA storage directory
  pub fn with_ca_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }

  /// Set the upstream certificate policy
  pub fn with_upstream_verification(mut self, verification: UpstreamVerification) -> Self {
    self.upstream_verification = verification;
    self
  }

  /// Trust an extra root for upstream connections
  pub fn with_extra_upstream_root(mut self, root: CertificateDer<'static>) -> Self {
    self.extra_upstream_roots.push(root);
    self
  }

  /// Enable or disable the system proxy redirect
  pub fn with_system_proxy(mut self, enabled: bool) -> Self {
    self.system_proxy = enabled;
    self
  }

  /// Set the upstream port used for redirected TLS connections
  pub fn with_transparent_upstream_port(mut self, port: u16) -> Self {
    self.transparent_upstream_port = port;
    self
  }

  /// Address handed to the system proxy configurator, e.g. `127.0.0.1:8888`
  pub fn listen_addr(&self) -> String {
    match self.listen_host.parse::<std::net::Ipv6Addr>() {
      Ok(_) => format!("[{}]:{}", self.listen_host, self.listen_port),
      Err(_) => format!("{}:{}", self.listen_host, self.listen_port),
    }
  }

  /// Parse the listen address into a socket address
  pub fn listen_socket_addr(&self) -> Option<SocketAddr> {
    self.listen_addr().parse().ok()
  }
}

/// Resolve the CA storage directory: `NETMIDDLER_HOME`, then `~/.netmiddler`.
pub fn default_storage_path() -> PathBuf {
  if let Some(path) = std::env::var_os(HOME_ENV) {
    return PathBuf::from(path);
  }
  let home = if cfg!(windows) {
    std::env::var_os("USERPROFILE")
  } else {
    std::env::var_os("HOME")
  };
  match home {
    Some(home) => PathBuf::from(home).join(".netmiddler"),
    None => PathBuf::from(".netmiddler"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_cli_contract() {
    let config = MitmConfig::default();
    assert_eq!(config.listen_port, 8888);
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.upstream_verification, UpstreamVerification::Strict);
    assert!(!config.print_headers);
    assert!(!config.print_body);
    assert!(config.system_proxy);
    assert_eq!(config.transparent_upstream_port, 443);
  }

  #[test]
  fn listen_addr_brackets_ipv6() {
    let mut config = MitmConfig::default().with_port(9000);
    assert_eq!(config.listen_addr(), "127.0.0.1:9000");
    config.listen_host = "::1".to_string();
    assert_eq!(config.listen_addr(), "[::1]:9000");
    assert!(config.listen_socket_addr().is_some());
  }
}
