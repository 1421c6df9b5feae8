//! Error types for netmiddler

use std::io;
use thiserror::Error;

/// Result type for netmiddler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy setup and connection handling
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Root or leaf certificate generation, signing or persistence failed
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// A trust store refused to install or remove the root
  #[error("Trust store error ({store}): {detail}")]
  TrustStoreError {
    /// Name of the store, e.g. "system" or "java"
    store: String,
    /// Diagnostic output of the failing operation
    detail: String,
  },

  /// Enabling or disabling the system proxy redirect failed
  #[error("System proxy error: {0}")]
  SystemProxyError(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// HTTP protocol error while serving or forwarding
  #[error("Hyper error: {0}")]
  HyperError(hyper::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// An operation exceeded its deadline
  #[error("Timed out: {0}")]
  Timeout(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("[CA] {}", error);
    error
  }

  /// Create a TLS error
  pub fn tls_error(msg: impl Into<String>) -> Self {
    Error::TlsError(msg.into())
  }

  /// Create a trust store error and log it
  pub fn trust_store_error(store: impl Into<String>, detail: impl Into<String>) -> Self {
    let error = Error::TrustStoreError {
      store: store.into(),
      detail: detail.into(),
    };
    tracing::error!("[TRUST] {}", error);
    error
  }

  /// Create a system proxy error and log it
  pub fn system_proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::SystemProxyError(msg.into());
    tracing::error!("[SYSPROXY] {}", error);
    error
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create a connection error
  pub fn connection_error(msg: impl Into<String>) -> Self {
    Error::ConnectionError(msg.into())
  }

  /// Create a timeout error
  pub fn timeout(msg: impl Into<String>) -> Self {
    Error::Timeout(msg.into())
  }

  /// Whether this error belongs to startup (CA or redirect setup) rather than
  /// to a single proxied connection.
  pub fn is_setup(&self) -> bool {
    matches!(
      self,
      Error::CertificateError(_) | Error::TrustStoreError { .. } | Error::SystemProxyError(_)
    )
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::HttpError(value)
  }
}

impl From<hyper::Error> for Error {
  fn from(value: hyper::Error) -> Self {
    Error::HyperError(value)
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::TlsError(value.to_string())
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn setup_errors_are_classified() {
    assert!(Error::CertificateError("x".into()).is_setup());
    assert!(Error::SystemProxyError("x".into()).is_setup());
    assert!(Error::TrustStoreError {
      store: "system".into(),
      detail: "denied".into()
    }
    .is_setup());
    assert!(!Error::connection_error("reset").is_setup());
    assert!(!Error::from(io::Error::other("boom")).is_setup());
  }

  #[test]
  fn trust_store_error_names_store() {
    let e = Error::TrustStoreError {
      store: "java".into(),
      detail: "keytool failed".into(),
    };
    assert_eq!(e.to_string(), "Trust store error (java): keytool failed");
  }
}
