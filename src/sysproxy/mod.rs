//! Redirect the host's HTTP(S) egress to the local listener and put it back.
//!
//! One [`SystemProxy`] backend exists per platform. The
//! [`SystemProxyConfigurator`] wraps a backend and owns the single
//! [`ProxyRedirectState`] captured before any mutation, so that `disable`
//! restores exactly once no matter how many exit paths call it.

use crate::error::{Error, Result};
use std::sync::{Mutex, MutexGuard};

mod command;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
mod memory;
#[cfg(target_os = "windows")]
pub mod windows;

pub use memory::MemorySystemProxy;

/// A platform mechanism for routing traffic through a proxy
pub trait SystemProxy: Send + Sync {
  /// Snapshot of the configuration the backend overwrites
  type State: Send;

  /// Short name used in logs
  fn name(&self) -> &'static str;

  /// Record the current configuration without changing it
  fn capture(&self) -> Result<Self::State>;

  /// Route HTTP and HTTPS egress to `listen` (`host:port`)
  fn apply(&self, listen: &str) -> Result<()>;

  /// Put back a previously captured configuration
  fn restore(&self, state: Self::State) -> Result<()>;

  /// Socket mark the proxy must set on its own upstream connections to
  /// escape the redirect, if the backend needs one
  fn egress_mark(&self) -> Option<u32> {
    None
  }
}

/// Prior system configuration, held while the redirect is active
#[derive(Debug)]
pub struct ProxyRedirectState<S> {
  /// Address the redirect points at
  pub listen: String,
  /// Backend snapshot taken before the change
  pub snapshot: S,
}

/// Object-safe handle the lifecycle controller drives
pub trait RedirectControl: Send + Sync {
  /// Capture the current configuration and redirect to `listen`
  fn enable(&self, listen: &str) -> Result<()>;

  /// Restore the captured configuration. Returns `false` when there was
  /// nothing to restore.
  fn disable(&self) -> Result<bool>;

  /// Whether a redirect is currently applied
  fn is_active(&self) -> bool;

  /// See [`SystemProxy::egress_mark`]
  fn egress_mark(&self) -> Option<u32>;
}

/// Applies a backend and guarantees a single restore
pub struct SystemProxyConfigurator<B: SystemProxy> {
  backend: B,
  state: Mutex<Option<ProxyRedirectState<B::State>>>,
}

impl<B: SystemProxy> SystemProxyConfigurator<B> {
  pub fn new(backend: B) -> Self {
    Self {
      backend,
      state: Mutex::new(None),
    }
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  // A panic while the lock is held must not prevent the restore.
  fn slot(&self) -> MutexGuard<'_, Option<ProxyRedirectState<B::State>>> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl<B: SystemProxy> RedirectControl for SystemProxyConfigurator<B> {
  fn enable(&self, listen: &str) -> Result<()> {
    if self.slot().is_some() {
      return Err(Error::system_proxy_error("redirect is already enabled"));
    }
    let snapshot = self.backend.capture()?;
    *self.slot() = Some(ProxyRedirectState {
      listen: listen.to_string(),
      snapshot,
    });

    // The lock is released here so a disable from a panic hook can run.
    if let Err(e) = self.backend.apply(listen) {
      if let Err(restore) = self.disable() {
        tracing::error!(
          "[SYSPROXY] Rolling back partial {} redirect failed: {}",
          self.backend.name(),
          restore
        );
      }
      return Err(e);
    }
    tracing::info!("[SYSPROXY] {} redirect to {} enabled", self.backend.name(), listen);
    Ok(())
  }

  fn disable(&self) -> Result<bool> {
    let Some(state) = self.slot().take() else {
      return Ok(false);
    };
    self.backend.restore(state.snapshot)?;
    tracing::info!(
      "[SYSPROXY] {} redirect to {} removed",
      self.backend.name(),
      state.listen
    );
    Ok(true)
  }

  fn is_active(&self) -> bool {
    self.slot().is_some()
  }

  fn egress_mark(&self) -> Option<u32> {
    self.backend.egress_mark()
  }
}

/// Backend for platforms without a supported mechanism
#[derive(Debug, Default)]
pub struct UnsupportedSystemProxy;

impl SystemProxy for UnsupportedSystemProxy {
  type State = ();

  fn name(&self) -> &'static str {
    "unsupported"
  }

  fn capture(&self) -> Result<()> {
    Ok(())
  }

  fn apply(&self, _listen: &str) -> Result<()> {
    Err(Error::system_proxy_error(
      "system proxy configuration is not supported on this platform",
    ))
  }

  fn restore(&self, _state: ()) -> Result<()> {
    Ok(())
  }
}

/// The configurator for the host platform
pub fn platform_configurator() -> Box<dyn RedirectControl> {
  #[cfg(target_os = "linux")]
  return Box::new(SystemProxyConfigurator::new(linux::NatRedirect::default()));
  #[cfg(target_os = "macos")]
  return Box::new(SystemProxyConfigurator::new(macos::NetworkServiceProxy::default()));
  #[cfg(target_os = "windows")]
  return Box::new(SystemProxyConfigurator::new(windows::WinInetProxy::default()));
  #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
  return Box::new(SystemProxyConfigurator::new(UnsupportedSystemProxy));
}

/// Split `host:port` and return the port
pub(crate) fn listen_port(listen: &str) -> Result<u16> {
  listen
    .rsplit_once(':')
    .and_then(|(_, port)| port.parse().ok())
    .ok_or_else(|| Error::system_proxy_error(format!("invalid listen address '{}'", listen)))
}

/// Split `host:port` and return the host without IPv6 brackets
pub(crate) fn listen_host(listen: &str) -> Result<&str> {
  listen
    .rsplit_once(':')
    .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
    .filter(|host| !host.is_empty())
    .ok_or_else(|| Error::system_proxy_error(format!("invalid listen address '{}'", listen)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enable_then_disable_restores_prior_setting() {
    let backend = MemorySystemProxy::with_setting(None);
    let configurator = SystemProxyConfigurator::new(backend);

    configurator.enable("127.0.0.1:8888").unwrap();
    assert!(configurator.is_active());
    assert_eq!(
      configurator.backend().current().as_deref(),
      Some("127.0.0.1:8888")
    );

    assert!(configurator.disable().unwrap());
    assert_eq!(configurator.backend().current(), None);
    assert!(!configurator.is_active());
  }

  #[test]
  fn disable_is_idempotent() {
    let configurator =
      SystemProxyConfigurator::new(MemorySystemProxy::with_setting(Some("corp:3128".into())));
    assert!(!configurator.disable().unwrap(), "nothing to restore yet");

    configurator.enable("127.0.0.1:8888").unwrap();
    assert!(configurator.disable().unwrap());
    assert!(!configurator.disable().unwrap());
    assert_eq!(configurator.backend().restore_count(), 1);
    assert_eq!(configurator.backend().current().as_deref(), Some("corp:3128"));
  }

  #[test]
  fn failed_apply_rolls_back() {
    let configurator = SystemProxyConfigurator::new(
      MemorySystemProxy::with_setting(Some("corp:3128".into())).failing_apply(),
    );
    assert!(configurator.enable("127.0.0.1:8888").is_err());
    assert!(!configurator.is_active());
    assert_eq!(configurator.backend().restore_count(), 1);
    assert_eq!(configurator.backend().current().as_deref(), Some("corp:3128"));
  }

  #[test]
  fn double_enable_is_rejected() {
    let configurator = SystemProxyConfigurator::new(MemorySystemProxy::with_setting(None));
    configurator.enable("127.0.0.1:8888").unwrap();
    assert!(configurator.enable("127.0.0.1:9999").is_err());
    assert!(configurator.disable().unwrap());
    assert_eq!(configurator.backend().current(), None);
  }

  #[test]
  fn listen_address_parts() {
    assert_eq!(listen_port("127.0.0.1:8888").unwrap(), 8888);
    assert_eq!(listen_host("[::1]:8888").unwrap(), "::1");
    assert!(listen_port("localhost").is_err());
  }
}
