//! Per network service HTTP/HTTPS proxy settings through `networksetup`,
//! which commits to the SystemConfiguration preferences store.

use super::command::run;
use super::{listen_host, listen_port, SystemProxy};
use crate::error::Result;

const NETWORKSETUP: &str = "/usr/sbin/networksetup";

/// One proxy protocol entry of a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxySetting {
  pub enabled: bool,
  pub server: String,
  pub port: u16,
}

/// Web and secure web proxy of one network service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceProxy {
  pub service: String,
  pub web: ProxySetting,
  pub secure_web: ProxySetting,
}

#[derive(Debug, Default)]
pub struct NetworkServiceProxy;

impl SystemProxy for NetworkServiceProxy {
  type State = Vec<ServiceProxy>;

  fn name(&self) -> &'static str {
    "networksetup"
  }

  fn capture(&self) -> Result<Vec<ServiceProxy>> {
    let listing = run(NETWORKSETUP, &["-listallnetworkservices"])?;
    let mut services = Vec::new();
    for service in parse_services(&listing) {
      let web = parse_proxy(&run(NETWORKSETUP, &["-getwebproxy", &service])?);
      let secure_web = parse_proxy(&run(NETWORKSETUP, &["-getsecurewebproxy", &service])?);
      services.push(ServiceProxy {
        service,
        web,
        secure_web,
      });
    }
    Ok(services)
  }

  fn apply(&self, listen: &str) -> Result<()> {
    let host = listen_host(listen)?;
    let port = listen_port(listen)?.to_string();
    let listing = run(NETWORKSETUP, &["-listallnetworkservices"])?;
    for service in parse_services(&listing) {
      run(NETWORKSETUP, &["-setwebproxy", &service, host, &port])?;
      run(NETWORKSETUP, &["-setsecurewebproxy", &service, host, &port])?;
    }
    Ok(())
  }

  fn restore(&self, state: Vec<ServiceProxy>) -> Result<()> {
    let mut first_error = None;
    for entry in &state {
      for (set, set_state, setting) in [
        ("-setwebproxy", "-setwebproxystate", &entry.web),
        ("-setsecurewebproxy", "-setsecurewebproxystate", &entry.secure_web),
      ] {
        if let Err(e) = restore_setting(&entry.service, set, set_state, setting) {
          tracing::warn!("[SYSPROXY] Restoring {} failed: {}", entry.service, e);
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

fn restore_setting(service: &str, set: &str, set_state: &str, setting: &ProxySetting) -> Result<()> {
  if !setting.server.is_empty() {
    let port = setting.port.to_string();
    run(NETWORKSETUP, &[set, service, &setting.server, &port])?;
  }
  let state = if setting.enabled { "on" } else { "off" };
  run(NETWORKSETUP, &[set_state, service, state])?;
  Ok(())
}

/// Enabled services from `-listallnetworkservices`. The first line is a
/// legend and disabled services are prefixed with `*`.
pub fn parse_services(listing: &str) -> Vec<String> {
  listing
    .lines()
    .skip(1)
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('*'))
    .map(str::to_string)
    .collect()
}

/// Parse `-getwebproxy` style output
pub fn parse_proxy(output: &str) -> ProxySetting {
  let mut setting = ProxySetting::default();
  for line in output.lines() {
    let Some((key, value)) = line.split_once(':') else {
      continue;
    };
    let value = value.trim();
    match key.trim() {
      "Enabled" => setting.enabled = value.eq_ignore_ascii_case("yes"),
      "Server" => setting.server = value.to_string(),
      "Port" => setting.port = value.parse().unwrap_or(0),
      _ => {}
    }
  }
  setting
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn services_skip_legend_and_disabled() {
    let listing = "An asterisk (*) denotes that a network service is disabled.\n\
Wi-Fi\n\
*Thunderbolt Bridge\n\
USB 10/100/1000 LAN\n";
    assert_eq!(parse_services(listing), vec!["Wi-Fi", "USB 10/100/1000 LAN"]);
  }

  #[test]
  fn proxy_output_is_parsed() {
    let output = "Enabled: Yes\nServer: proxy.corp\nPort: 3128\nAuthenticated Proxy Enabled: 0\n";
    assert_eq!(
      parse_proxy(output),
      ProxySetting {
        enabled: true,
        server: "proxy.corp".into(),
        port: 3128
      }
    );
    let unset = parse_proxy("Enabled: No\nServer: \nPort: 0\n");
    assert!(!unset.enabled);
    assert!(unset.server.is_empty());
  }
}
