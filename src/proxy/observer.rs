//! Read-only traffic observation hooks

use crate::proxy::target::Target;
use std::net::SocketAddr;
use std::sync::Arc;

/// Which way bytes are travelling
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  ClientToServer,
  ServerToClient,
}

impl Direction {
  fn arrow(self) -> &'static str {
    match self {
      Direction::ClientToServer => "->",
      Direction::ServerToClient => "<-",
    }
  }
}

/// Identity of one proxied exchange
#[derive(Clone, Debug)]
pub struct Flow {
  /// Process-unique id
  pub id: u64,
  /// Client peer address
  pub client: SocketAddr,
  /// Upstream destination
  pub target: Target,
  /// Whether TLS is being terminated for this flow
  pub intercepted: bool,
}

/// Hook receiving decrypted traffic. Observers cannot modify what they see.
pub trait TrafficObserver: Send + Sync {
  /// A request head was received from the client
  fn on_request_head(&self, _flow: &Flow, _head: &http::request::Parts) {}

  /// A response head was received from the upstream
  fn on_response_head(&self, _flow: &Flow, _head: &http::response::Parts) {}

  /// Payload bytes passed through
  fn on_data(&self, _flow: &Flow, _direction: Direction, _data: &[u8]) {}
}

/// Fans traffic out to registered observers
#[derive(Default, Clone)]
pub struct ObserverHandler {
  observers: Vec<Arc<dyn TrafficObserver>>,
}

impl ObserverHandler {
  /// Create a new observer handler
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an observer
  pub fn add_observer(&mut self, observer: Arc<dyn TrafficObserver>) {
    self.observers.push(observer);
  }

  /// Check if there are any observers registered
  pub fn has_observers(&self) -> bool {
    !self.observers.is_empty()
  }

  pub fn request_head(&self, flow: &Flow, head: &http::request::Parts) {
    for observer in &self.observers {
      observer.on_request_head(flow, head);
    }
  }

  pub fn response_head(&self, flow: &Flow, head: &http::response::Parts) {
    for observer in &self.observers {
      observer.on_response_head(flow, head);
    }
  }

  pub fn data(&self, flow: &Flow, direction: Direction, data: &[u8]) {
    for observer in &self.observers {
      observer.on_data(flow, direction, data);
    }
  }
}

/// Logs heads and payloads through `tracing`
#[derive(Debug, Clone, Copy)]
pub struct LoggingObserver {
  pub print_headers: bool,
  pub print_body: bool,
}

impl LoggingObserver {
  pub fn new(print_headers: bool, print_body: bool) -> Self {
    Self {
      print_headers,
      print_body,
    }
  }

  fn format_headers(headers: &http::HeaderMap) -> String {
    headers
      .iter()
      .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
      .collect::<Vec<_>>()
      .join("\n")
  }
}

impl TrafficObserver for LoggingObserver {
  fn on_request_head(&self, flow: &Flow, head: &http::request::Parts) {
    if self.print_headers {
      tracing::info!(
        "[HTTP] #{} {} {} {:?}\n{}",
        flow.id,
        head.method,
        head.uri,
        head.version,
        Self::format_headers(&head.headers)
      );
    }
  }

  fn on_response_head(&self, flow: &Flow, head: &http::response::Parts) {
    if self.print_headers {
      tracing::info!(
        "[HTTP] #{} {} {}\n{}",
        flow.id,
        flow.target,
        head.status,
        Self::format_headers(&head.headers)
      );
    }
  }

  fn on_data(&self, flow: &Flow, direction: Direction, data: &[u8]) {
    if self.print_body {
      tracing::info!(
        "[MITM] #{} {} {} {} bytes\n{}",
        flow.id,
        direction.arrow(),
        flow.target,
        data.len(),
        String::from_utf8_lossy(data)
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[derive(Default)]
  struct Recorder {
    seen: Mutex<Vec<(Direction, Vec<u8>)>>,
  }

  impl TrafficObserver for Recorder {
    fn on_data(&self, _flow: &Flow, direction: Direction, data: &[u8]) {
      self.seen.lock().unwrap().push((direction, data.to_vec()));
    }
  }

  #[test]
  fn handler_fans_out_to_every_observer() {
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let mut handler = ObserverHandler::new();
    assert!(!handler.has_observers());
    handler.add_observer(first.clone());
    handler.add_observer(second.clone());
    handler.add_observer(Arc::new(LoggingObserver::new(false, false)));

    let flow = Flow {
      id: 1,
      client: "127.0.0.1:5000".parse().unwrap(),
      target: Target::new("example.com", 443),
      intercepted: true,
    };
    handler.data(&flow, Direction::ServerToClient, b"hello");

    for recorder in [&first, &second] {
      let seen = recorder.seen.lock().unwrap();
      assert_eq!(seen.as_slice(), &[(Direction::ServerToClient, b"hello".to_vec())]);
    }
  }
}
