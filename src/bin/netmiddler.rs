use anyhow::{Context, Result};
use clap::Parser;
use netmiddler::ca::CaManager;
use netmiddler::config::{self, DEFAULT_PORT};
use netmiddler::proxy::{LoggingObserver, ObserverHandler};
use netmiddler::sysproxy::RedirectControl;
use netmiddler::{sysproxy, Lifecycle, MitmConfig, UpstreamVerification};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Local TLS-intercepting forward proxy.
///
/// Installs a private root certificate, redirects the system's HTTP and
/// HTTPS traffic to itself and logs the decrypted exchanges. The previous
/// proxy configuration is restored on exit.
#[derive(Parser, Debug)]
#[command(name = "netmiddler")]
#[command(version, about)]
struct Args {
  /// Port to listen on
  #[arg(short, long, default_value_t = DEFAULT_PORT)]
  port: u16,

  /// Address to listen on
  #[arg(long, default_value = "127.0.0.1")]
  host: String,

  /// Remove the root certificate from all trust stores and exit
  #[arg(long)]
  uninstall: bool,

  /// Log request and response headers.
  ///
  /// Off by default, so a plain run logs only connection events; pass this
  /// flag to see every header.
  #[arg(long)]
  print_headers: bool,

  /// Log decrypted payloads (off by default)
  #[arg(long)]
  print_body: bool,

  /// Directory holding the root certificate and key
  #[arg(long, env = config::HOME_ENV)]
  ca_dir: Option<PathBuf>,

  /// Do not verify certificates presented by upstream servers
  #[arg(long)]
  insecure_upstream: bool,

  /// Serve without changing the system proxy configuration
  #[arg(long)]
  no_system_proxy: bool,

  /// Upstream connect timeout in seconds
  #[arg(long, default_value_t = 10)]
  connect_timeout: u64,

  /// TLS handshake timeout in seconds
  #[arg(long, default_value_t = 10)]
  handshake_timeout: u64,

  /// Validity of forged leaf certificates in days
  #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u64).range(1..=397))]
  leaf_lifetime_days: u64,
}

impl Args {
  fn into_config(self) -> MitmConfig {
    let mut config = MitmConfig::default().with_port(self.port);
    config.listen_host = self.host;
    if let Some(dir) = self.ca_dir {
      config = config.with_ca_storage_path(dir);
    }
    if self.insecure_upstream {
      config = config.with_upstream_verification(UpstreamVerification::Insecure);
    }
    config.print_headers = self.print_headers;
    config.print_body = self.print_body;
    config.connect_timeout = Duration::from_secs(self.connect_timeout);
    config.handshake_timeout = Duration::from_secs(self.handshake_timeout);
    config.leaf_lifetime = Duration::from_secs(self.leaf_lifetime_days * 24 * 60 * 60);
    config.with_system_proxy(!self.no_system_proxy)
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .init();

  match run(Args::parse()).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("{:#}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(args: Args) -> Result<()> {
  let uninstall = args.uninstall;
  let config = args.into_config();
  let ca = CaManager::with_system_stores(&config.ca_storage_path);

  let mut observers = ObserverHandler::new();
  if config.print_headers || config.print_body {
    observers.add_observer(Arc::new(LoggingObserver::new(
      config.print_headers,
      config.print_body,
    )));
  }

  let redirect: Arc<dyn RedirectControl> = Arc::from(sysproxy::platform_configurator());
  let lifecycle = Lifecycle::new(config, ca, redirect, observers);
  if uninstall {
    return lifecycle
      .uninstall()
      .await
      .context("failed to uninstall the root certificate");
  }
  lifecycle.run().await.context("proxy setup failed")
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::CommandFactory;

  #[test]
  fn print_flags_default_off_and_say_so() {
    let args = Args::try_parse_from(["netmiddler"]).unwrap();
    assert!(!args.print_headers);
    assert!(!args.print_body);

    let help = Args::command().render_long_help().to_string();
    assert!(help.contains("Off by default"));
    assert!(help.contains("off by default"));
  }
}
