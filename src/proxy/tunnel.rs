//! TLS interception: terminate the client's TLS with a forged leaf, open TLS
//! to the real host and relay the plaintext between them.

use crate::ca::LeafIssuer;
use crate::error::{Error, Result};
use crate::proxy::connector::Connector;
use crate::proxy::observer::{Direction, Flow, ObserverHandler};
use crate::proxy::target::Target;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};

const RELAY_BUFFER: usize = 16 * 1024;
/// Upstream port for redirected TLS connections
pub const TRANSPARENT_PORT: u16 = 443;

/// Performs the double handshake and relays the decrypted bytes
#[derive(Clone)]
pub struct TunnelEngine {
  issuer: Arc<LeafIssuer>,
  connector: Connector,
  observers: Arc<ObserverHandler>,
  handshake_timeout: Duration,
  transparent_port: u16,
}

impl TunnelEngine {
  pub fn new(
    issuer: Arc<LeafIssuer>,
    connector: Connector,
    observers: Arc<ObserverHandler>,
    handshake_timeout: Duration,
  ) -> Self {
    Self {
      issuer,
      connector,
      observers,
      handshake_timeout,
      transparent_port: TRANSPARENT_PORT,
    }
  }

  /// Port dialled for connections intercepted without CONNECT
  pub fn with_transparent_port(mut self, port: u16) -> Self {
    self.transparent_port = port;
    self
  }

  /// Intercept a CONNECT tunnel whose 200 response was already sent
  pub async fn intercept<IO>(&self, client: IO, flow: &Flow) -> Result<()>
  where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let leaf = self.issuer.issue(&flow.target.host).await?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let client_tls = tokio::time::timeout(self.handshake_timeout, acceptor.accept(client))
      .await
      .map_err(|_| Error::timeout(format!("client TLS handshake for {}", flow.target)))?
      .map_err(|e| Error::tls_error(format!("client TLS handshake for {}: {}", flow.target, e)))?;
    tracing::debug!("[MITM] #{} client TLS established for {}", flow.id, flow.target);

    let upstream = self.connector.connect_tls(&flow.target).await?;
    tracing::debug!("[MITM] #{} upstream TLS established to {}", flow.id, flow.target);

    relay(client_tls, upstream, flow, &self.observers).await
  }

  /// Intercept a TLS connection that arrived without CONNECT (NAT redirect),
  /// taking the hostname from the ClientHello SNI.
  pub async fn intercept_transparent(&self, stream: TcpStream, client: SocketAddr, id: u64) -> Result<()> {
    let start = tokio::time::timeout(
      self.handshake_timeout,
      LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    .map_err(|_| Error::timeout("waiting for ClientHello"))?
    .map_err(|e| Error::tls_error(format!("reading ClientHello: {}", e)))?;

    let host = start
      .client_hello()
      .server_name()
      .map(str::to_string)
      .ok_or_else(|| Error::invalid_request("redirected TLS connection without SNI"))?;
    let flow = Flow {
      id,
      client,
      target: Target::new(host, self.transparent_port),
      intercepted: true,
    };

    let leaf = self.issuer.issue(&flow.target.host).await?;
    let client_tls = tokio::time::timeout(self.handshake_timeout, start.into_stream(leaf.server_config()))
      .await
      .map_err(|_| Error::timeout(format!("client TLS handshake for {}", flow.target)))?
      .map_err(|e| Error::tls_error(format!("client TLS handshake for {}: {}", flow.target, e)))?;

    let upstream = self.connector.connect_tls(&flow.target).await?;
    relay(client_tls, upstream, &flow, &self.observers).await
  }
}

/// Copy both directions until one side closes or fails, then close both.
pub async fn relay<C, U>(client: C, upstream: U, flow: &Flow, observers: &ObserverHandler) -> Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

  let result = tokio::select! {
    r = pump(&mut client_read, &mut upstream_write, flow, Direction::ClientToServer, observers) => r,
    r = pump(&mut upstream_read, &mut client_write, flow, Direction::ServerToClient, observers) => r,
  };

  let _ = upstream_write.shutdown().await;
  let _ = client_write.shutdown().await;

  match result {
    Ok(bytes) => {
      tracing::debug!("[MITM] #{} {} closed after {} bytes", flow.id, flow.target, bytes);
      Ok(())
    }
    Err(e) => Err(e),
  }
}

async fn pump<R, W>(
  reader: &mut R,
  writer: &mut W,
  flow: &Flow,
  direction: Direction,
  observers: &ObserverHandler,
) -> Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; RELAY_BUFFER];
  let mut total = 0u64;
  loop {
    let n = match reader.read(&mut buf).await {
      Ok(0) => return Ok(total),
      Ok(n) => n,
      // Peers commonly drop TCP without close_notify.
      Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(total),
      Err(e) => return Err(e.into()),
    };
    observers.data(flow, direction, &buf[..n]);
    writer.write_all(&buf[..n]).await?;
    writer.flush().await?;
    total += n as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn relay_copies_and_closes_both_sides() {
    let (client, mut client_peer) = tokio::io::duplex(1024);
    let (upstream, mut upstream_peer) = tokio::io::duplex(1024);
    let flow = Flow {
      id: 7,
      client: "127.0.0.1:1".parse().unwrap(),
      target: Target::new("example.com", 443),
      intercepted: true,
    };
    let observers = ObserverHandler::new();

    let task = tokio::spawn(async move { relay(client, upstream, &flow, &observers).await });

    client_peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    upstream_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    upstream_peer.write_all(b"pong").await.unwrap();
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    drop(upstream_peer);
    task.await.unwrap().unwrap();

    let mut rest = Vec::new();
    client_peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "client side must see EOF once upstream closes");
  }
}
