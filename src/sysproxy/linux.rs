//! netfilter NAT redirect of outbound ports 80 and 443.
//!
//! Rules are inserted at the head of `nat OUTPUT`. Connections opened by the
//! proxy itself carry [`EGRESS_MARK`] and are skipped by the rules.

use super::command::{run, run_with_input};
use super::{listen_port, SystemProxy};
use crate::error::Result;

/// Firewall mark set on the proxy's upstream sockets ("NM")
pub const EGRESS_MARK: u32 = 0x4e4d;
const REDIRECTED_PORTS: [u16; 2] = [80, 443];

/// `OUTPUT` chain rules of the nat table as printed by `iptables -S`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NatSnapshot {
  pub rules: Vec<String>,
}

/// Redirect through `iptables`
#[derive(Debug)]
pub struct NatRedirect {
  iptables: String,
  iptables_restore: String,
}

impl Default for NatRedirect {
  fn default() -> Self {
    Self {
      iptables: "iptables".to_string(),
      iptables_restore: "iptables-restore".to_string(),
    }
  }
}

impl SystemProxy for NatRedirect {
  type State = NatSnapshot;

  fn name(&self) -> &'static str {
    "iptables"
  }

  fn capture(&self) -> Result<NatSnapshot> {
    let listing = run(&self.iptables, &["-t", "nat", "-S", "OUTPUT"])?;
    Ok(parse_output_rules(&listing))
  }

  fn apply(&self, listen: &str) -> Result<()> {
    let port = listen_port(listen)?.to_string();
    for rule in redirect_rules(&port) {
      let mut args = vec!["-t", "nat", "-I", "OUTPUT", "1"];
      args.extend(rule.iter().map(String::as_str));
      run(&self.iptables, &args)?;
    }
    Ok(())
  }

  fn restore(&self, state: NatSnapshot) -> Result<()> {
    run_with_input(&self.iptables_restore, &["--noflush"], &restore_script(&state))
  }

  fn egress_mark(&self) -> Option<u32> {
    Some(EGRESS_MARK)
  }
}

/// Keep the `-A OUTPUT` lines, dropping the policy line
pub fn parse_output_rules(listing: &str) -> NatSnapshot {
  NatSnapshot {
    rules: listing
      .lines()
      .map(str::trim)
      .filter(|line| line.starts_with("-A OUTPUT"))
      .map(str::to_string)
      .collect(),
  }
}

/// Rule specs (after `-I OUTPUT 1`) redirecting web ports to `port`
pub fn redirect_rules(port: &str) -> Vec<Vec<String>> {
  REDIRECTED_PORTS
    .iter()
    .map(|dport| {
      let dport = dport.to_string();
      let mark = format!("{:#x}", EGRESS_MARK);
      [
        "-p",
        "tcp",
        "--dport",
        dport.as_str(),
        "-m",
        "mark",
        "!",
        "--mark",
        mark.as_str(),
        "-j",
        "REDIRECT",
        "--to-ports",
        port,
      ]
      .into_iter()
      .map(str::to_string)
      .collect()
    })
    .collect()
}

/// `iptables-restore --noflush` input that empties `nat OUTPUT` and replays
/// the snapshot
pub fn restore_script(state: &NatSnapshot) -> String {
  let mut script = String::from("*nat\n-F OUTPUT\n");
  for rule in &state.rules {
    script.push_str(rule);
    script.push('\n');
  }
  script.push_str("COMMIT\n");
  script
}

#[cfg(test)]
mod tests {
  use super::*;

  const LISTING: &str = "-P OUTPUT ACCEPT\n\
-A OUTPUT -d 127.0.0.11/32 -j DOCKER_OUTPUT\n\
-A OUTPUT ! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER\n";

  #[test]
  fn snapshot_keeps_only_append_rules() {
    let snapshot = parse_output_rules(LISTING);
    assert_eq!(snapshot.rules.len(), 2);
    assert!(snapshot.rules.iter().all(|r| r.starts_with("-A OUTPUT")));
  }

  #[test]
  fn restore_replays_snapshot_in_order() {
    let snapshot = parse_output_rules(LISTING);
    let script = restore_script(&snapshot);
    assert_eq!(
      script,
      "*nat\n-F OUTPUT\n\
-A OUTPUT -d 127.0.0.11/32 -j DOCKER_OUTPUT\n\
-A OUTPUT ! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER\n\
COMMIT\n"
    );
  }

  #[test]
  fn empty_chain_restores_to_empty() {
    let script = restore_script(&parse_output_rules("-P OUTPUT ACCEPT\n"));
    assert_eq!(script, "*nat\n-F OUTPUT\nCOMMIT\n");
  }

  #[test]
  fn redirect_rules_skip_marked_traffic() {
    let rules = redirect_rules("8888");
    assert_eq!(rules.len(), 2);
    let https = rules[1].join(" ");
    assert_eq!(
      https,
      "-p tcp --dport 443 -m mark ! --mark 0x4e4d -j REDIRECT --to-ports 8888"
    );
  }
}
