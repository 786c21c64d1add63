//! Device discovery from the ARP table and active sweeps.

use crate::{
    exec::{argv, DefaultExec, Exec, ExecOpts},
    scan::arp,
    schema::{canonical_mac, device::DeviceBuilder, Device, ZERO_MAC},
    state::{unix_now, AppState},
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use std::{collections::HashMap, time::Duration};

/// Receive window of the active ARP sweep.
const SWEEP_WINDOW: Duration = Duration::from_secs(3);

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Populates the device map of the state store.
pub struct DeviceScanner {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
        }
    }
}

impl DeviceScanner {
    /// Passive scan: merge the host's ARP table into the device map.
    pub async fn scan_arp_table(&self, state: &AppState) -> Result<usize> {
        let output = self
            .exec
            .run(&argv(["arp", "-an"]), &ExecOpts::default())
            .await
            .context("read ARP table")?;

        let mut patch = HashMap::new();
        for (mac, ip) in parse_arp_table(&output) {
            patch.insert(mac.clone(), device(&mac, &ip)?);
        }
        let count = patch.len();
        state.update_devices(patch);
        info!("ARP table scan recorded {} devices", count);
        Ok(count)
    }

    /// Active scan: ARP-sweep the subnet of every interface that is up and
    /// addressed, merging the answering hosts into the device map.
    pub async fn sweep_local_subnets(&self, state: &AppState) -> Result<usize> {
        let mut total = 0;
        for iface in state.interfaces_filtered(false, false, true) {
            let cidr = match iface.ip_address() {
                Some(cidr) => cidr.clone(),
                None => continue,
            };
            let network: Ipv4Network = match cidr.parse() {
                Ok(network) => network,
                Err(e) => {
                    debug!("Skipping {} with unparsable address {}: {}", iface.name(), cidr, e);
                    continue;
                }
            };
            let src_mac = match parse_raw_mac(iface.mac()) {
                Some(mac) => mac,
                None => {
                    debug!("Skipping {} without a usable MAC", iface.name());
                    continue;
                }
            };

            debug!("ARP sweep of {} on {}", network, iface.name());
            let replies = match arp::sweep(iface.name(), src_mac, network, SWEEP_WINDOW).await {
                Ok(replies) => replies,
                Err(e) => {
                    warn!("ARP sweep on {} failed: {:#}", iface.name(), e);
                    continue;
                }
            };

            let mut patch = HashMap::new();
            for (ip, mac) in replies {
                patch.insert(mac.clone(), device(&mac, &ip.to_string())?);
            }
            total += patch.len();
            state.update_devices(patch);
        }
        info!("Active sweep recorded {} devices", total);
        Ok(total)
    }
}

fn device(mac: &str, ip: &str) -> Result<Device> {
    Ok(DeviceBuilder::default()
        .mac(mac)
        .ip(Some(ip.to_string()))
        .last_seen(unix_now())
        .build()?)
}

/// Parse `arp -an` lines of the form
/// `? (192.168.1.10) at aa:bb:cc:dd:ee:ff [ether] on eth0` into
/// `(mac, ip)` pairs. Incomplete and all-zero entries are excluded.
pub fn parse_arp_table(output: &str) -> Vec<(String, String)> {
    let mut devices = Vec::new();
    for line in output.lines() {
        if line.to_lowercase().contains("incomplete") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let ip = parts[1].trim_matches(|c| c == '(' || c == ')').to_string();
        let mac = canonical_mac(parts[3]);
        if mac == ZERO_MAC || !mac.contains(':') {
            continue;
        }
        devices.push((mac, ip));
    }
    devices
}

fn parse_raw_mac(mac: &str) -> Option<[u8; 6]> {
    let parts: Vec<u8> = mac
        .split(':')
        .filter_map(|p| u8::from_str_radix(p, 16).ok())
        .collect();
    parts.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::ExecMock;

    const ARP_OUTPUT: &str = r#"? (192.168.1.1) at d8:cf:61:32:99:a7 [ether] on wlan0
? (192.168.1.20) at 52:54:00:aa:bb:cc [ether] on eth0
? (192.168.1.30) at <incomplete> on eth0
? (192.168.1.40) at 00:00:00:00:00:00 [ether] on eth0"#;

    #[test]
    fn arp_table_parsing() {
        let devices = parse_arp_table(ARP_OUTPUT);
        assert_eq!(
            devices,
            vec![
                ("D8:CF:61:32:99:A7".to_string(), "192.168.1.1".to_string()),
                ("52:54:00:AA:BB:CC".to_string(), "192.168.1.20".to_string()),
            ]
        );
    }

    #[test]
    fn arp_table_parsing_is_total() {
        assert!(parse_arp_table("").is_empty());
        assert!(parse_arp_table("garbage line\nanother one").is_empty());
    }

    #[test]
    fn raw_mac_parsing() {
        assert_eq!(
            parse_raw_mac("52:54:00:AA:BB:CC"),
            Some([0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc])
        );
        assert_eq!(parse_raw_mac("not-a-mac"), None);
    }

    #[tokio::test]
    async fn passive_scan_merges_devices() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok(ARP_OUTPUT);

        let scanner = DeviceScannerBuilder::default()
            .exec(Box::new(mock) as Box<dyn Exec>)
            .build()?;
        let state = AppState::default();
        let count = scanner.scan_arp_table(&state).await?;
        assert_eq!(count, 2);

        let devices = state.get_devices();
        assert!(devices.contains_key("D8:CF:61:32:99:A7"));
        assert!(!devices.contains_key(ZERO_MAC));
        assert_eq!(
            devices["52:54:00:AA:BB:CC"].ip().as_deref(),
            Some("192.168.1.20")
        );
        Ok(())
    }

    #[tokio::test]
    async fn devices_accumulate_across_scans() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok("? (10.0.0.2) at aa:aa:aa:aa:aa:aa [ether] on wlan0");
        mock.push_ok("? (10.0.0.3) at bb:bb:bb:bb:bb:bb [ether] on wlan0");

        let scanner = DeviceScannerBuilder::default()
            .exec(Box::new(mock) as Box<dyn Exec>)
            .build()?;
        let state = AppState::default();
        scanner.scan_arp_table(&state).await?;
        scanner.scan_arp_table(&state).await?;

        assert_eq!(state.get_devices().len(), 2);
        Ok(())
    }
}
