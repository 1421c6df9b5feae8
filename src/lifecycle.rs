//! Startup ordering and guaranteed teardown.
//!
//! Startup runs: ensure the root is trusted, load it into a leaf issuer,
//! bind the listener, redirect system traffic, serve. However the process
//! leaves `run`, the redirect is reverted exactly once: the normal path
//! disables it explicitly, [`RedirectGuard`] covers early returns and
//! unwinding, and a chained panic hook covers builds that abort on panic.

use crate::ca::{CaManager, LeafIssuer};
use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::proxy::{ObserverHandler, ProxyServer};
use crate::sysproxy::RedirectControl;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Reverts the system redirect when dropped
pub struct RedirectGuard {
  redirect: Arc<dyn RedirectControl>,
}

impl RedirectGuard {
  pub fn new(redirect: Arc<dyn RedirectControl>) -> Self {
    Self { redirect }
  }
}

impl Drop for RedirectGuard {
  fn drop(&mut self) {
    disable_logged(self.redirect.as_ref());
  }
}

fn disable_logged(redirect: &dyn RedirectControl) {
  match redirect.disable() {
    Ok(true) => tracing::info!("[SYSPROXY] System proxy configuration restored"),
    Ok(false) => {}
    Err(e) => tracing::error!(
      "[SYSPROXY] Failed to restore system proxy configuration, fix it manually: {}",
      e
    ),
  }
}

/// Chain a panic hook that reverts the redirect before the process dies.
///
/// With unwinding the guard's `Drop` does this already, and task panics
/// must not tear down a proxy that keeps running, so the hook only acts
/// when panics abort.
fn install_panic_hook(redirect: Weak<dyn RedirectControl>) {
  let previous = std::panic::take_hook();
  std::panic::set_hook(Box::new(move |info| {
    if cfg!(panic = "abort") {
      if let Some(redirect) = redirect.upgrade() {
        disable_logged(redirect.as_ref());
      }
    }
    previous(info);
  }));
}

/// Future resolving on the first termination signal.
///
/// Handlers are registered when this is called, not when it is polled, so
/// a signal arriving during startup is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static> {
  use tokio::signal::unix::{signal, SignalKind};
  let mut interrupt = signal(SignalKind::interrupt())?;
  let mut terminate = signal(SignalKind::terminate())?;
  let mut hangup = signal(SignalKind::hangup())?;
  Ok(async move {
    let name = tokio::select! {
      _ = interrupt.recv() => "SIGINT",
      _ = terminate.recv() => "SIGTERM",
      _ = hangup.recv() => "SIGHUP",
    };
    tracing::info!("[MITM] Received {}, shutting down", name);
  })
}

#[cfg(windows)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static> {
  let mut ctrl_c = tokio::signal::windows::ctrl_c()?;
  let mut ctrl_close = tokio::signal::windows::ctrl_close()?;
  Ok(async move {
    tokio::select! {
      _ = ctrl_c.recv() => {},
      _ = ctrl_close.recv() => {},
    }
    tracing::info!("[MITM] Received console close, shutting down");
  })
}

#[cfg(not(any(unix, windows)))]
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static> {
  Ok(async {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("[MITM] Received Ctrl-C, shutting down");
  })
}

/// Orchestrates the CA manager, the system redirect and the proxy server
pub struct Lifecycle {
  config: MitmConfig,
  ca: CaManager,
  redirect: Arc<dyn RedirectControl>,
  observers: ObserverHandler,
}

impl Lifecycle {
  pub fn new(
    config: MitmConfig,
    ca: CaManager,
    redirect: Arc<dyn RedirectControl>,
    observers: ObserverHandler,
  ) -> Self {
    Self {
      config,
      ca,
      redirect,
      observers,
    }
  }

  /// Remove the root from every trust store and from disk, without serving
  pub async fn uninstall(&self) -> Result<()> {
    self.ca.ensure(true).await?;
    Ok(())
  }

  /// Run until a termination signal arrives
  pub async fn run(self) -> Result<()> {
    let signal = shutdown_signal()?;
    self.run_until(signal).await
  }

  /// Run until `shutdown` resolves, then drain and revert the redirect.
  ///
  /// Errors returned from here are setup failures; per-connection errors
  /// never reach this level.
  pub async fn run_until<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let trigger = stop_tx.clone();
    let watcher = tokio::spawn(async move {
      tokio::select! {
        _ = shutdown => { let _ = trigger.send(true); }
        _ = trigger.closed() => {}
      }
    });

    let result = self.start_and_serve(stop_rx).await;
    watcher.abort();
    drop(stop_tx);
    result
  }

  async fn start_and_serve(&self, stop: watch::Receiver<bool>) -> Result<()> {
    self.ca.ensure(false).await?;
    let root = self.ca.load().await?;
    tracing::info!(
      "[CA] Root {} valid until {}",
      root.common_name(),
      root.not_after()
    );
    let issuer = Arc::new(LeafIssuer::new(
      Arc::new(root),
      self.config.leaf_lifetime,
      self.config.cert_cache_capacity,
    ));

    let server = ProxyServer::new(
      self.config.clone(),
      issuer,
      self.observers.clone(),
      self.redirect.egress_mark(),
    )?;
    let listener = server.bind().await?;
    let local = listener.local_addr()?;

    let guard = RedirectGuard::new(self.redirect.clone());
    let weak: Weak<dyn RedirectControl> = Arc::downgrade(&self.redirect);
    install_panic_hook(weak);

    if self.config.system_proxy {
      let redirect = self.redirect.clone();
      let target = redirect_target(local).to_string();
      tokio::task::spawn_blocking(move || redirect.enable(&target))
        .await
        .map_err(|e| Error::system_proxy_error(format!("enable task failed: {}", e)))??;
    } else {
      tracing::warn!(
        "[SYSPROXY] System proxy configuration skipped, point clients at {} manually",
        local
      );
    }

    if *stop.borrow() {
      tracing::info!("[MITM] Shutdown requested during startup, not serving");
    } else {
      server.serve(listener, stop).await?;
    }

    let redirect = self.redirect.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || disable_logged(redirect.as_ref())).await {
      tracing::error!("[SYSPROXY] Restore task failed: {}", e);
    }
    drop(guard);
    Ok(())
  }
}

/// Address other programs should use to reach a listener bound to `local`
fn redirect_target(local: SocketAddr) -> SocketAddr {
  match local.ip() {
    IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local.port()),
    IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), local.port()),
    _ => local,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sysproxy::{MemorySystemProxy, SystemProxyConfigurator};

  #[test]
  fn unspecified_listener_is_redirected_to_loopback() {
    let target = redirect_target("0.0.0.0:8888".parse().unwrap());
    assert_eq!(target, "127.0.0.1:8888".parse::<SocketAddr>().unwrap());
    let target = redirect_target("[::]:8888".parse().unwrap());
    assert_eq!(target, "[::1]:8888".parse::<SocketAddr>().unwrap());
    let target = redirect_target("192.168.1.2:80".parse().unwrap());
    assert_eq!(target, "192.168.1.2:80".parse::<SocketAddr>().unwrap());
  }

  #[test]
  fn guard_restores_once_when_unwinding() {
    let redirect = Arc::new(SystemProxyConfigurator::new(MemorySystemProxy::with_setting(
      Some("corp:3128".to_string()),
    )));
    redirect.enable("127.0.0.1:8888").unwrap();

    let control: Arc<dyn RedirectControl> = redirect.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _guard = RedirectGuard::new(control.clone());
      panic!("boom");
    }));
    assert!(result.is_err());
    drop(RedirectGuard::new(control));

    assert_eq!(redirect.backend().restore_count(), 1);
    assert_eq!(redirect.backend().current().as_deref(), Some("corp:3128"));
  }
}
