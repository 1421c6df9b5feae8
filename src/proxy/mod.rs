//! The MITM tunnel engine: listener, CONNECT interception and plain HTTP
//! forwarding.

pub mod connector;
pub mod forward;
pub mod observer;
pub mod server;
pub mod target;
pub mod tunnel;

pub use connector::Connector;
pub use observer::{Direction, Flow, LoggingObserver, ObserverHandler, TrafficObserver};
pub use server::{Phase, ProxyServer};
pub use target::Target;
pub use tunnel::TunnelEngine;
