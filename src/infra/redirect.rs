//! Linux iptables traffic redirection with full reversal tracking.
//!
//! Every applied rule is mirrored by its `-D` form in an append-only undo
//! log; teardown replays the log in reverse, flushes the managed tables and
//! clears IP forwarding iff this instance enabled it. Cleanup never raises.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use log::{debug, info, warn};

/// Tables swept during teardown.
const TABLES: &[&str] = &["filter", "nat", "mangle", "raw"];

#[derive(Builder, Debug)]
#[builder(pattern = "owned", setter(into))]
/// Owns the iptables reversal log and the IP forwarding marker.
pub struct TrafficRedirector {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,

    #[builder(setter(skip))]
    undo: Vec<Vec<String>>,

    #[builder(setter(skip))]
    we_enabled_forwarding: bool,
}

impl Default for TrafficRedirector {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
            undo: vec![],
            we_enabled_forwarding: false,
        }
    }
}

/// The redirection rule set, in application order. Each entry is a full
/// iptables argument vector in its `-A` form.
pub fn redirection_rules(
    ap_iface: &str,
    internet_iface: &str,
    gateway_ip: &str,
    portal_port: u16,
) -> Vec<Vec<String>> {
    let portal = format!("{}:{}", gateway_ip, portal_port);
    vec![
        // NAT out of the uplink.
        argv(["-t", "nat", "-A", "POSTROUTING", "-o", internet_iface, "-j", "MASQUERADE"]),
        // HTTP onto the portal.
        argv([
            "-t", "nat", "-A", "PREROUTING", "-i", ap_iface, "-p", "tcp", "--dport", "80",
            "-j", "DNAT", "--to-destination", &portal,
        ]),
        // HTTPS too; clients will see certificate warnings.
        argv([
            "-t", "nat", "-A", "PREROUTING", "-i", ap_iface, "-p", "tcp", "--dport", "443",
            "-j", "DNAT", "--to-destination", &portal,
        ]),
        // Drop external DNS so clients stay on our resolver.
        argv(["-A", "FORWARD", "-i", ap_iface, "-p", "udp", "--dport", "53", "-j", "DROP"]),
        argv(["-A", "FORWARD", "-i", ap_iface, "-o", internet_iface, "-j", "ACCEPT"]),
        argv(["-A", "FORWARD", "-i", internet_iface, "-o", ap_iface, "-j", "ACCEPT"]),
        argv(["-A", "FORWARD", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"]),
    ]
}

/// The `-D` reversal of a rule in `-A` form.
fn undo_rule(rule: &[String]) -> Vec<String> {
    rule.iter()
        .map(|part| if part == "-A" { "-D".to_string() } else { part.clone() })
        .collect()
}

impl TrafficRedirector {
    /// Turn on kernel IP forwarding, remembering that we did.
    pub async fn enable_ip_forwarding(&mut self) -> Result<()> {
        info!("Enabling IP forwarding");
        self.exec
            .run(
                &argv(["sysctl", "-w", "net.ipv4.ip_forward=1"]),
                &ExecOpts::root(),
            )
            .await
            .context("enable IP forwarding")?;
        self.we_enabled_forwarding = true;
        Ok(())
    }

    /// Install the redirection rule set. On any step's failure the already
    /// applied rules are rolled back and [`Error::InfraStartupFailed`]
    /// surfaces.
    pub async fn setup_redirection_rules(
        &mut self,
        ap_iface: &str,
        internet_iface: &str,
        gateway_ip: &str,
        portal_port: u16,
    ) -> Result<()> {
        info!("Setting up traffic redirection for {}", ap_iface);

        for rule in redirection_rules(ap_iface, internet_iface, gateway_ip, portal_port) {
            let mut cmd = vec!["iptables".to_string()];
            cmd.extend(rule.iter().cloned());
            debug!("Applying iptables rule: {}", rule.join(" "));

            if let Err(e) = self.exec.run(&cmd, &ExecOpts::root()).await {
                warn!("Rule failed, rolling back: {:#}", e);
                self.clear_redirection_rules().await;
                return Err(Error::InfraStartupFailed(format!(
                    "iptables rule '{}' failed: {}",
                    rule.join(" "),
                    crate::error::chain(e)
                ))
                .into());
            }
            self.undo.push(undo_rule(&rule));
        }

        info!("All traffic redirection rules applied");
        Ok(())
    }

    /// Replay the undo log in reverse, flush and delete custom chains across
    /// the managed tables, and clear IP forwarding iff we enabled it.
    /// Partial failures are logged, never raised.
    pub async fn clear_redirection_rules(&mut self) {
        info!("Clearing traffic redirection rules");

        for rule in self.undo.drain(..).rev() {
            let mut cmd = vec!["iptables".to_string()];
            cmd.extend(rule);
            self.exec.run_unchecked(&cmd, &ExecOpts::root_unchecked()).await;
        }

        for table in TABLES {
            self.exec
                .run_unchecked(&argv(["iptables", "-t", table, "-F"]), &ExecOpts::root_unchecked())
                .await;
            self.exec
                .run_unchecked(&argv(["iptables", "-t", table, "-X"]), &ExecOpts::root_unchecked())
                .await;
        }

        if self.we_enabled_forwarding {
            debug!("Disabling IP forwarding");
            self.exec
                .run_unchecked(
                    &argv(["sysctl", "-w", "net.ipv4.ip_forward=0"]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
            self.we_enabled_forwarding = false;
        }
    }

    /// Number of rules awaiting reversal.
    pub fn pending_undo(&self) -> usize {
        self.undo.len()
    }

    /// Whether this instance turned IP forwarding on.
    pub fn forwarding_enabled(&self) -> bool {
        self.we_enabled_forwarding
    }
}

impl Drop for TrafficRedirector {
    fn drop(&mut self) {
        // Reversal is async work; the workflow teardown is the documented
        // cleanup path and runs on every exit.
        if !self.undo.is_empty() || self.we_enabled_forwarding {
            warn!(
                "TrafficRedirector dropped with {} unreversed rules (forwarding: {})",
                self.undo.len(),
                self.we_enabled_forwarding
            );
        }
    }
}
