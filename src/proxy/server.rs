//! MITM proxy server implementation

use crate::ca::LeafIssuer;
use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::proxy::connector::Connector;
use crate::proxy::forward::{self, ProxyBody};
use crate::proxy::observer::{Flow, ObserverHandler};
use crate::proxy::target::Target;
use crate::proxy::tunnel::TunnelEngine;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;
/// How long closing connections get to exit after the drain timeout
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Shutdown phase broadcast to connection tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
  /// Accepting and serving
  Running,
  /// Listener closed; HTTP connections finish their current exchange
  Draining,
  /// Remaining connections are torn down
  Closing,
}

/// Counts live connection tasks
#[derive(Default)]
struct ConnectionTracker {
  active: AtomicUsize,
  idle: Notify,
}

struct ConnectionGuard(Arc<ConnectionTracker>);

impl ConnectionTracker {
  fn track(self: &Arc<Self>) -> ConnectionGuard {
    self.active.fetch_add(1, Ordering::SeqCst);
    ConnectionGuard(self.clone())
  }

  async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      if self.active.load(Ordering::SeqCst) == 0 {
        return;
      }
      notified.await;
    }
  }
}

impl Drop for ConnectionGuard {
  fn drop(&mut self) {
    if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.0.idle.notify_waiters();
    }
  }
}

/// Proxy server implementation
#[derive(Clone)]
pub struct ProxyServer {
  config: MitmConfig,
  connector: Connector,
  tunnel: TunnelEngine,
  observers: Arc<ObserverHandler>,
  next_flow: Arc<AtomicU64>,
}

impl ProxyServer {
  /// Create a new proxy server. `egress_mark` tags upstream sockets when a
  /// NAT redirect is in place.
  pub fn new(
    config: MitmConfig,
    issuer: Arc<LeafIssuer>,
    observers: ObserverHandler,
    egress_mark: Option<u32>,
  ) -> Result<Self> {
    let connector = Connector::new(&config, egress_mark)?;
    let observers = Arc::new(observers);
    let tunnel = TunnelEngine::new(
      issuer,
      connector.clone(),
      observers.clone(),
      config.handshake_timeout,
    )
    .with_transparent_port(config.transparent_upstream_port);
    Ok(Self {
      config,
      connector,
      tunnel,
      observers,
      next_flow: Arc::new(AtomicU64::new(1)),
    })
  }

  /// Bind the configured listen address
  pub async fn bind(&self) -> Result<TcpListener> {
    let addr = self.config.listen_addr();
    TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to bind to {}: {}", addr, e)))
  }

  /// Serve `listener` until `shutdown` becomes true, then drain.
  ///
  /// Each connection runs in its own task; a failing connection is logged
  /// and dropped without affecting the listener.
  pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let tracker = Arc::new(ConnectionTracker::default());
    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("[MITM] Listening on {}", addr);
    }

    loop {
      tokio::select! {
        _ = stop_requested(&mut shutdown) => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let server = self.clone();
            let phase = phase_rx.clone();
            let guard = tracker.track();
            tokio::spawn(async move {
              if let Err(e) = server.handle_connection(stream, peer, phase, guard).await {
                tracing::debug!("[MITM] Connection from {} ended: {}", peer, e);
              }
            });
          }
          Err(e) => {
            tracing::warn!("[MITM] Failed to accept connection: {}", e);
            tokio::time::sleep(Duration::from_millis(50)).await;
          }
        },
      }
    }

    drop(listener);
    let active = tracker.active.load(Ordering::SeqCst);
    tracing::info!("[MITM] Listener closed, draining {} connection(s)", active);
    let _ = phase_tx.send(Phase::Draining);
    if tokio::time::timeout(self.config.drain_timeout, tracker.wait_idle())
      .await
      .is_err()
    {
      tracing::info!("[MITM] Drain timeout reached, closing remaining connections");
      let _ = phase_tx.send(Phase::Closing);
      let _ = tokio::time::timeout(CLOSE_GRACE, tracker.wait_idle()).await;
    }
    Ok(())
  }

  fn next_flow_id(&self) -> u64 {
    self.next_flow.fetch_add(1, Ordering::Relaxed)
  }

  /// Handle a client connection
  async fn handle_connection(
    self,
    stream: TcpStream,
    peer: SocketAddr,
    mut phase: watch::Receiver<Phase>,
    guard: ConnectionGuard,
  ) -> Result<()> {
    // Peek the first byte to determine protocol
    let mut first_byte = [0u8; 1];
    let peeked = tokio::select! {
      r = stream.peek(&mut first_byte) => r?,
      _ = reached(&mut phase, |p| p != Phase::Running) => return Ok(()),
    };
    if peeked == 0 {
      return Ok(());
    }

    if first_byte[0] == TLS_HANDSHAKE {
      let id = self.next_flow_id();
      tokio::select! {
        r = self.tunnel.intercept_transparent(stream, peer, id) => r,
        _ = reached(&mut phase, |p| p == Phase::Closing) => Ok(()),
      }
    } else {
      self.serve_http(stream, peer, phase, guard).await
    }
  }

  async fn serve_http(
    self,
    stream: TcpStream,
    peer: SocketAddr,
    mut phase: watch::Receiver<Phase>,
    guard: ConnectionGuard,
  ) -> Result<()> {
    let local = stream.local_addr()?;
    let guard = Arc::new(guard);
    let server = self.clone();
    let service_phase = phase.clone();
    let service = service_fn(move |req: Request<Incoming>| {
      let server = server.clone();
      let phase = service_phase.clone();
      let guard = guard.clone();
      async move { Ok::<_, Infallible>(server.route(req, peer, local, phase, guard).await) }
    });

    let conn = http1::Builder::new()
      .preserve_header_case(true)
      .title_case_headers(true)
      .serve_connection(TokioIo::new(stream), service)
      .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    loop {
      if !draining && *phase.borrow_and_update() != Phase::Running {
        conn.as_mut().graceful_shutdown();
        draining = true;
      }
      tokio::select! {
        r = conn.as_mut() => return r.map_err(Error::from),
        changed = phase.changed() => {
          if changed.is_err() || *phase.borrow() == Phase::Closing {
            return Ok(());
          }
        }
      }
    }
  }

  async fn route(
    &self,
    req: Request<Incoming>,
    peer: SocketAddr,
    local: SocketAddr,
    phase: watch::Receiver<Phase>,
    guard: Arc<ConnectionGuard>,
  ) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
      return self.connect(req, peer, local, phase, guard);
    }

    let target = match request_target(&req) {
      Ok(target) => target,
      Err(e) => return status_response(StatusCode::BAD_REQUEST, &e),
    };
    if forward::has_passed_through(req.headers()) || targets_listener(&target, local) {
      tracing::warn!("[HTTP] Refusing request from {} addressed to the proxy itself ({})", peer, target);
      let e = Error::invalid_request(format!("{} is this proxy", target));
      return status_response(StatusCode::LOOP_DETECTED, &e);
    }
    let flow = Flow {
      id: self.next_flow_id(),
      client: peer,
      target,
      intercepted: false,
    };
    tracing::debug!("[HTTP] #{} {} {}", flow.id, req.method(), flow.target);
    match forward::forward(req, flow, &self.connector, self.observers.clone()).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!("[HTTP] Forwarding to upstream failed: {}", e);
        forward::bad_gateway(&e)
      }
    }
  }

  /// Answer CONNECT with 200 and intercept the upgraded stream in its own task
  fn connect(
    &self,
    req: Request<Incoming>,
    peer: SocketAddr,
    local: SocketAddr,
    mut phase: watch::Receiver<Phase>,
    guard: Arc<ConnectionGuard>,
  ) -> Response<ProxyBody> {
    let target = match req.uri().authority() {
      Some(authority) => Target::parse(authority.as_str(), 443),
      None => Err(Error::invalid_request(format!("CONNECT without authority: {}", req.uri()))),
    };
    let target = match target {
      Ok(target) => target,
      Err(e) => return status_response(StatusCode::BAD_REQUEST, &e),
    };
    if targets_listener(&target, local) {
      let e = Error::invalid_request(format!("{} is this proxy", target));
      return status_response(StatusCode::LOOP_DETECTED, &e);
    }
    let flow = Flow {
      id: self.next_flow_id(),
      client: peer,
      target,
      intercepted: true,
    };
    let (head, body) = req.into_parts();
    self.observers.request_head(&flow, &head);
    let req = Request::from_parts(head, body);

    let tunnel = self.tunnel.clone();
    tokio::spawn(async move {
      let _guard = guard;
      let upgraded = match hyper::upgrade::on(req).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
          tracing::debug!("[MITM] #{} CONNECT upgrade failed: {}", flow.id, e);
          return;
        }
      };
      let result = tokio::select! {
        r = tunnel.intercept(TokioIo::new(upgraded), &flow) => r,
        _ = reached(&mut phase, |p| p == Phase::Closing) => Ok(()),
      };
      if let Err(e) = result {
        tracing::warn!("[MITM] #{} tunnel to {} failed: {}", flow.id, flow.target, e);
      }
    });

    Response::new(forward::empty())
  }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
  let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn reached(phase: &mut watch::Receiver<Phase>, done: fn(Phase) -> bool) {
  let _ = phase.wait_for(|p| done(*p)).await;
}

/// Whether `target` names the listener that accepted the connection
fn targets_listener(target: &Target, local: SocketAddr) -> bool {
  if target.port != local.port() {
    return false;
  }
  match target.host.parse::<IpAddr>() {
    Ok(ip) => ip == local.ip() || ip.is_loopback() || ip.is_unspecified(),
    Err(_) => target.host.eq_ignore_ascii_case("localhost"),
  }
}

/// Target of a non-CONNECT request: absolute-form URI, else the Host header
fn request_target(req: &Request<Incoming>) -> Result<Target> {
  let secure = req.uri().scheme() == Some(&http::uri::Scheme::HTTPS);
  let default_port = if secure { 443 } else { 80 };
  if let Some(authority) = req.uri().authority() {
    return Target::parse(authority.as_str(), default_port);
  }
  let host = req
    .headers()
    .get(http::header::HOST)
    .and_then(|h| h.to_str().ok())
    .ok_or_else(|| Error::invalid_request("request without Host header"))?;
  Target::parse(host, default_port)
}

fn status_response(status: StatusCode, error: &Error) -> Response<ProxyBody> {
  let mut response = Response::new(forward::full(format!("netmiddler: {}\n", error)));
  *response.status_mut() = status;
  response
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn listener_address_is_recognised() {
    let local: SocketAddr = "127.0.0.1:8888".parse().unwrap();
    assert!(targets_listener(&Target::new("127.0.0.1", 8888), local));
    assert!(targets_listener(&Target::new("LOCALHOST", 8888), local));
    assert!(targets_listener(&Target::new("::1", 8888), local));
    assert!(!targets_listener(&Target::new("127.0.0.1", 8080), local));
    assert!(!targets_listener(&Target::new("example.com", 8888), local));

    let lan: SocketAddr = "192.168.1.20:8888".parse().unwrap();
    assert!(targets_listener(&Target::new("192.168.1.20", 8888), lan));
    assert!(!targets_listener(&Target::new("192.168.1.21", 8888), lan));
  }
}
