//! # netmiddler
//!
//! A local TLS-intercepting forward proxy.
//!
//! On start it makes sure a private root certificate exists and is trusted
//! by the machine, redirects the operating system's HTTP and HTTPS traffic
//! to its listener, and then terminates every CONNECT tunnel with a leaf
//! certificate forged for the requested host. Decrypted traffic is handed
//! to [`proxy::TrafficObserver`]s and relayed unchanged to the real server.
//!
//! ```no_run
//! use netmiddler::ca::CaManager;
//! use netmiddler::proxy::ObserverHandler;
//! use netmiddler::sysproxy::{self, RedirectControl};
//! use netmiddler::{Lifecycle, MitmConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> netmiddler::Result<()> {
//! let config = MitmConfig::default().with_port(8888);
//! let ca = CaManager::with_system_stores(&config.ca_storage_path);
//! let redirect: Arc<dyn RedirectControl> = Arc::from(sysproxy::platform_configurator());
//! Lifecycle::new(config, ca, redirect, ObserverHandler::new())
//!   .run()
//!   .await
//! # }
//! ```
//!
//! The root is written to `~/.netmiddler` (or `$NETMIDDLER_HOME`) as
//! `netmiddler-ca.pem` and `netmiddler-ca-key.pem`. Run with
//! `--uninstall` to remove it from every trust store it was added to.

pub mod ca;
pub mod config;
mod error;
pub mod lifecycle;
pub mod proxy;
pub mod sysproxy;

pub use config::{MitmConfig, UpstreamVerification};
pub use error::{Error, Result};
pub use lifecycle::Lifecycle;
