//! Plain HTTP forwarding for non-CONNECT requests

use crate::error::{Error, Result};
use crate::proxy::connector::Connector;
use crate::proxy::observer::{Direction, Flow, ObserverHandler};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// `Via` entry added to forwarded requests
const VIA: &str = "1.1 netmiddler";

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

pub fn empty() -> ProxyBody {
  Empty::<Bytes>::new()
    .map_err(|never| match never {})
    .boxed()
}

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
  Full::new(chunk.into())
    .map_err(|never| match never {})
    .boxed()
}

/// Response returned when the upstream cannot be reached
pub fn bad_gateway(error: &Error) -> Response<ProxyBody> {
  let mut response = Response::new(full(format!("netmiddler: {}\n", error)));
  *response.status_mut() = StatusCode::BAD_GATEWAY;
  response.headers_mut().insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}

/// Drop hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Forward `req` to `flow.target` and stream the response back.
///
/// The request is rewritten to origin form and hop-by-hop headers are
/// removed in both directions; everything else passes through unchanged.
pub async fn forward(
  req: Request<Incoming>,
  flow: Flow,
  connector: &Connector,
  observers: Arc<ObserverHandler>,
) -> Result<Response<ProxyBody>> {
  let (mut parts, body) = req.into_parts();
  let secure = parts.uri.scheme() == Some(&http::uri::Scheme::HTTPS);

  let path = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  parts.uri = path
    .parse::<Uri>()
    .map_err(|e| Error::invalid_request(format!("invalid request path: {}", e)))?;
  strip_hop_by_hop(&mut parts.headers);
  if !parts.headers.contains_key(header::HOST) {
    let host = if flow.target.port == default_port(secure) {
      flow.target.host.clone()
    } else {
      flow.target.authority()
    };
    let host = HeaderValue::from_str(&host)
      .map_err(|e| Error::invalid_request(format!("invalid host: {}", e)))?;
    parts.headers.insert(header::HOST, host);
  }
  parts.version = http::Version::HTTP_11;
  parts
    .headers
    .append(header::VIA, HeaderValue::from_static(VIA));
  observers.request_head(&flow, &parts);

  let body = observed(body, flow.clone(), Direction::ClientToServer, observers.clone());
  let outbound = Request::from_parts(parts, body);

  let response = if secure {
    let stream = connector.connect_tls(&flow.target).await?;
    send(stream, outbound).await?
  } else {
    let stream = connector.connect(&flow.target).await?;
    send(stream, outbound).await?
  };

  let (mut parts, body) = response.into_parts();
  strip_hop_by_hop(&mut parts.headers);
  observers.response_head(&flow, &parts);
  let body = observed(body, flow, Direction::ServerToClient, observers);
  Ok(Response::from_parts(parts, body))
}

/// Whether a request already carries this proxy's `Via` entry
pub fn has_passed_through(headers: &HeaderMap) -> bool {
  headers
    .get_all(header::VIA)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|entry| entry.trim().eq_ignore_ascii_case(VIA))
}

fn default_port(secure: bool) -> u16 {
  if secure {
    443
  } else {
    80
  }
}

async fn send<IO>(io: IO, req: Request<ProxyBody>) -> Result<Response<Incoming>>
where
  IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
    .preserve_header_case(true)
    .title_case_headers(true)
    .handshake(TokioIo::new(io))
    .await?;
  tokio::spawn(async move {
    if let Err(e) = conn.await {
      tracing::debug!("[HTTP] Upstream connection ended: {}", e);
    }
  });
  Ok(sender.send_request(req).await?)
}

/// Tee body frames to the observers
fn observed(
  body: Incoming,
  flow: Flow,
  direction: Direction,
  observers: Arc<ObserverHandler>,
) -> ProxyBody {
  if !observers.has_observers() {
    return body.boxed();
  }
  body
    .map_frame(move |frame| {
      if let Some(data) = frame.data_ref() {
        observers.data(&flow, direction, data);
      }
      frame
    })
    .boxed()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hop_by_hop_headers_are_removed() {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
    headers.insert("x-trace", HeaderValue::from_static("1"));
    headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    strip_hop_by_hop(&mut headers);
    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key(header::ACCEPT));
  }

  #[test]
  fn via_entry_is_detected() {
    let mut headers = HeaderMap::new();
    assert!(!has_passed_through(&headers));
    headers.insert(header::VIA, HeaderValue::from_static("1.0 fred, 1.1 netmiddler"));
    assert!(has_passed_through(&headers));
    headers.insert(header::VIA, HeaderValue::from_static("1.1 squid"));
    assert!(!has_passed_through(&headers));
  }

  #[test]
  fn bad_gateway_reports_cause() {
    let response = bad_gateway(&Error::connection_error("refused"));
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  }
}
