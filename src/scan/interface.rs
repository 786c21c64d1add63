//! Interface discovery.
//!
//! Combines `ip link show`, `ip addr show`, `ethtool -i` and the iw tooling
//! into validated [`Interface`] records. The `iw list` output is parsed once
//! per scan and cached per wiphy.

use crate::{
    exec::{argv, DefaultExec, Exec, ExecOpts},
    schema::{canonical_mac, Capabilities, Interface, Mode, ZERO_MAC},
    schema::interface::InterfaceBuilder,
    state::AppState,
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

lazy_static! {
    /// Curated set of Wi-Fi drivers; a match marks the interface wireless.
    static ref WIFI_DRIVERS: HashSet<&'static str> = [
        "iwlwifi",
        "ath9k",
        "ath9k_htc",
        "ath10k_pci",
        "ath11k_pci",
        "rt2800usb",
        "mt76",
        "mt7601u",
        "mt7921u",
        "brcmfmac",
        "rtl8812au",
        "rtl88xxau",
        "r8188eu",
        "8188eu",
    ]
    .into_iter()
    .collect();
}

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Populates the interface map of the state store.
pub struct InterfaceScanner {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,
}

impl Default for InterfaceScanner {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
        }
    }
}

impl InterfaceScanner {
    /// Scan the host's interfaces and replace their records in the store.
    /// Invalid rows are logged and dropped; re-running replaces every field
    /// of every known interface.
    pub async fn scan(&self, state: &AppState) -> Result<usize> {
        let link_output = self
            .exec
            .run(&argv(["ip", "link", "show"]), &ExecOpts::default())
            .await
            .context("list links")?;
        let links = parse_link_show(&link_output);

        let mut wiphy_capabilities: Option<HashMap<String, Capabilities>> = None;
        let mut found = HashMap::new();

        for link in links {
            if link.loopback {
                debug!("Skipping loopback interface {}", link.name);
                continue;
            }

            let addr_output = self
                .exec
                .run_unchecked(
                    &argv(["ip", "addr", "show", "dev", &link.name]),
                    &ExecOpts::default(),
                )
                .await;
            let ip_address = parse_addr_show(&addr_output);

            let ethtool_output = self
                .exec
                .run_unchecked(&argv(["ethtool", "-i", &link.name]), &ExecOpts::root_unchecked())
                .await;
            let driver = parse_ethtool_driver(&ethtool_output);
            let is_wireless = driver
                .as_deref()
                .map(|d| WIFI_DRIVERS.contains(d))
                .unwrap_or(false);

            let mut builder = InterfaceBuilder::default()
                .name(link.name.clone())
                .mac(link.mac.clone())
                .is_up(link.is_up)
                .ip_address(ip_address)
                .driver(driver)
                .is_wireless(is_wireless)
                .mode(Mode::Ethernet);

            if is_wireless {
                let info_output = self
                    .exec
                    .run_unchecked(
                        &argv(["iw", "dev", &link.name, "info"]),
                        &ExecOpts::root_unchecked(),
                    )
                    .await;
                let info = parse_iw_dev_info(&info_output);

                builder = builder
                    .mode(info.mode)
                    .ssid(info.ssid)
                    .tx_power(info.tx_power)
                    .channel_frequency(info.channel);

                if let Some(wiphy) = &info.wiphy {
                    if wiphy_capabilities.is_none() {
                        let list_output = self
                            .exec
                            .run_unchecked(&argv(["iw", "list"]), &ExecOpts::root_unchecked())
                            .await;
                        wiphy_capabilities = Some(parse_iw_list(&list_output));
                    }
                    let capabilities = wiphy_capabilities
                        .as_ref()
                        .and_then(|caps| caps.get(wiphy).copied())
                        .unwrap_or_default();
                    builder = builder.wiphy(Some(wiphy.clone())).capabilities(capabilities);
                }
            }

            let iface = match builder.build() {
                Ok(iface) => iface,
                Err(e) => {
                    warn!("Could not assemble interface {}: {}", link.name, e);
                    continue;
                }
            };
            if let Err(e) = iface.validate() {
                warn!("Dropping invalid interface row: {}", e);
                continue;
            }
            info!(
                "Detected interface: {} - {} ({})",
                iface.name(),
                iface.mac(),
                iface.ip_address().as_deref().unwrap_or("no IP")
            );
            found.insert(link.name, iface);
        }

        let count = found.len();
        state.update_interfaces(found);
        info!("Interface scan finished, {} interfaces recorded", count);
        Ok(count)
    }
}

#[derive(Debug)]
struct LinkRow {
    name: String,
    mac: String,
    is_up: bool,
    loopback: bool,
}

/// Parse `ip link show`: interface header lines carry name and flags, the
/// following `link/...` line carries the MAC.
fn parse_link_show(output: &str) -> Vec<LinkRow> {
    let mut rows: Vec<LinkRow> = Vec::new();

    for line in output.lines() {
        let first = match line.split_whitespace().next() {
            Some(first) => first,
            None => continue,
        };

        if first.ends_with(':') && first.trim_end_matches(':').parse::<u32>().is_ok() {
            // Header line: "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu ..."
            let mut parts = line.split_whitespace();
            parts.next();
            let raw_name = match parts.next() {
                Some(name) => name.trim_end_matches(':'),
                None => continue,
            };
            // VLAN/veth notation carries the parent after an '@'.
            let name = raw_name.split('@').next().unwrap_or(raw_name).to_string();
            let flags = parts.next().unwrap_or("");
            // Administrative up; LOWER_UP (carrier) is not required.
            let is_up = flags
                .trim_matches(|c| c == '<' || c == '>')
                .split(',')
                .any(|f| f == "UP");
            rows.push(LinkRow {
                name,
                mac: ZERO_MAC.to_string(),
                is_up,
                loopback: false,
            });
        } else if first.starts_with("link/") {
            if let Some(row) = rows.last_mut() {
                row.loopback = first == "link/loopback";
                if let Some(mac) = line.split_whitespace().nth(1) {
                    row.mac = canonical_mac(mac);
                }
            }
        }
    }

    rows
}

/// Extract the primary IPv4 CIDR from `ip addr show dev <x>`.
fn parse_addr_show(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("inet ") {
            return rest.split_whitespace().next().map(ToString::to_string);
        }
    }
    None
}

/// Extract the driver name from `ethtool -i <x>`.
fn parse_ethtool_driver(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("driver:") {
            let driver = rest.trim();
            if !driver.is_empty() {
                return Some(driver.to_string());
            }
        }
    }
    None
}

#[derive(Debug, Default)]
struct IwDevInfo {
    wiphy: Option<String>,
    mode: Mode,
    ssid: Option<String>,
    tx_power: Option<String>,
    channel: Option<String>,
}

/// Parse `iw dev <x> info`.
fn parse_iw_dev_info(output: &str) -> IwDevInfo {
    let mut info = IwDevInfo {
        mode: Mode::Unknown,
        ..Default::default()
    };
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("wiphy ") {
            info.wiphy = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("type ") {
            info.mode = Mode::from_iw(rest);
        } else if let Some(rest) = trimmed.strip_prefix("ssid ") {
            info.ssid = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("txpower ") {
            info.tx_power = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("channel ") {
            info.channel = Some(rest.trim().to_string());
        }
    }
    info
}

/// Parse `iw list` into per-wiphy capability flags. Wiphy sections start at
/// column zero with `Wiphy phyN`; the supported-modes subsection lists one
/// starred mode per line; `Band 1/2/4` sections carry the 2.4/5/6 GHz flags.
fn parse_iw_list(output: &str) -> HashMap<String, Capabilities> {
    let mut result = HashMap::new();
    let mut current: Option<(String, Capabilities)> = None;
    let mut in_modes = false;

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("Wiphy ") {
            if let Some((wiphy, caps)) = current.take() {
                result.insert(wiphy, caps);
            }
            let wiphy = rest.trim().trim_start_matches("phy").to_string();
            current = Some((wiphy, Capabilities::default()));
            in_modes = false;
            continue;
        }

        let caps = match current.as_mut() {
            Some((_, caps)) => caps,
            None => continue,
        };

        if trimmed.starts_with("Supported interface modes:") {
            in_modes = true;
            continue;
        }
        if in_modes {
            if let Some(mode) = trimmed.strip_prefix("* ") {
                match Mode::from_iw(mode) {
                    Mode::Monitor => {
                        caps.set_monitor(true);
                    }
                    Mode::Managed => {
                        caps.set_managed(true);
                    }
                    Mode::Ap => {
                        caps.set_ap(true);
                    }
                    Mode::Mesh => {
                        caps.set_mesh(true);
                    }
                    Mode::P2p => {
                        caps.set_p2p(true);
                    }
                    _ => {}
                }
                continue;
            }
            in_modes = false;
        }

        if trimmed.starts_with("Band 1:") {
            caps.set_band_2ghz(true);
        } else if trimmed.starts_with("Band 2:") {
            caps.set_band_5ghz(true);
        } else if trimmed.starts_with("Band 4:") {
            caps.set_band_6ghz(true);
        } else if trimmed.starts_with("HT20/HT40") || trimmed.contains("HT Capabilities") {
            caps.set_ht(true);
        } else if trimmed.contains("VHT Capabilities") {
            caps.set_vht(true);
        } else if trimmed.contains("HE Iftypes") || trimmed.contains("HE PHY Capabilities") {
            caps.set_he(true);
        }
    }

    if let Some((wiphy, caps)) = current.take() {
        result.insert(wiphy, caps);
    }
    result
}
