use crate::config::{MitmConfig, UpstreamVerification};
use crate::error::{Error, Result};
use crate::proxy::target::Target;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Dials real upstream servers over TCP and TLS
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  handshake_timeout: Duration,
  #[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
  mark: Option<u32>,
  tls: TlsConnector,
}

impl Connector {
  /// Build from the proxy configuration. `mark` tags upstream sockets so
  /// a NAT redirect does not loop them back to the proxy.
  pub fn new(config: &MitmConfig, mark: Option<u32>) -> Result<Self> {
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?;
    let mut tls = match config.upstream_verification {
      UpstreamVerification::Strict => {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in &config.extra_upstream_roots {
          roots
            .add(cert.clone())
            .map_err(|e| Error::tls_error(format!("invalid upstream root: {}", e)))?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
      }
      UpstreamVerification::Insecure => {
        tracing::warn!("[MITM] Upstream certificate verification is disabled");
        builder
          .dangerous()
          .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
          .with_no_client_auth()
      }
    };
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Self {
      connect_timeout: config.connect_timeout,
      handshake_timeout: config.handshake_timeout,
      mark,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }

  /// Resolve `target` and connect to the first address that answers
  pub async fn connect(&self, target: &Target) -> Result<TcpStream> {
    let addrs = tokio::time::timeout(
      self.connect_timeout,
      tokio::net::lookup_host((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| Error::timeout(format!("resolving {}", target)))?
    .map_err(|e| Error::connection_error(format!("resolving {}: {}", target, e)))?;

    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          tracing::debug!("[MITM] Connect to {} ({}) failed: {}", target, addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      Error::connection_error(format!("{} resolved to no addresses", target))
    }))
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(mark) = self.mark {
      raw_socket.set_mark(mark)?;
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    socket.set_nodelay(true)?;
    let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
      .await
      .map_err(|_| Error::timeout(format!("connecting to {}", addr)))??;
    Ok(stream)
  }

  /// Dial `target` and complete a client TLS handshake using its hostname
  pub async fn connect_tls(&self, target: &Target) -> Result<TlsStream<TcpStream>> {
    let stream = self.connect(target).await?;
    let domain = ServerName::try_from(target.host.clone())
      .map_err(|e| Error::invalid_request(format!("invalid server name {}: {}", target.host, e)))?;
    tokio::time::timeout(self.handshake_timeout, self.tls.connect(domain, stream))
      .await
      .map_err(|_| Error::timeout(format!("TLS handshake with {}", target)))?
      .map_err(|e| Error::tls_error(format!("TLS handshake with {}: {}", target, e)))
  }
}

/// Accepts any upstream certificate, still checking handshake signatures
#[derive(Debug)]
pub(crate) struct NoVerifier {
  algorithms: WebPkiSupportedAlgorithms,
}

impl NoVerifier {
  pub(crate) fn new(provider: &CryptoProvider) -> Self {
    Self {
      algorithms: provider.signature_verification_algorithms,
    }
  }
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    tokio_rustls::rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    tokio_rustls::rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.algorithms.supported_schemes()
  }
}
