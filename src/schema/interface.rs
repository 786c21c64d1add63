//! Network interface record and its capability flags.

use anyhow::{bail, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    PartialEq,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Operating mode of an interface.
pub enum Mode {
    Managed,
    Monitor,
    #[strum(serialize = "AP")]
    #[serde(rename = "AP")]
    Ap,
    Mesh,
    P2p,
    Adhoc,
    Ethernet,
    Loopback,
    #[default]
    Unknown,
}

impl Mode {
    /// Classify the mode string reported by `iw dev <x> info`.
    pub fn from_iw(raw: &str) -> Self {
        match raw.trim() {
            "managed" | "station" => Mode::Managed,
            "monitor" => Mode::Monitor,
            "AP" | "AP/VLAN" | "__ap" => Mode::Ap,
            "mesh point" | "mesh" => Mode::Mesh,
            "IBSS" => Mode::Adhoc,
            m if m.starts_with("P2P") => Mode::P2p,
            _ => Mode::Unknown,
        }
    }
}

#[derive(
    Builder, Clone, Copy, CopyGetters, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    Setters,
)]
#[builder(default, pattern = "owned")]
#[serde(default)]
#[getset(get_copy = "pub", set = "pub")]
/// Capabilities derived from the wiphy's supported modes and bands, not from
/// the interface's current mode.
pub struct Capabilities {
    /// The wiphy advertises monitor mode.
    monitor: bool,
    /// The wiphy advertises managed (station) mode.
    managed: bool,
    /// The wiphy advertises AP mode.
    ap: bool,
    /// The wiphy advertises mesh point mode.
    mesh: bool,
    /// The wiphy advertises a P2P mode.
    p2p: bool,
    /// 2.4 GHz band support.
    band_2ghz: bool,
    /// 5 GHz band support.
    band_5ghz: bool,
    /// 6 GHz band support.
    band_6ghz: bool,
    /// 802.11n (HT).
    ht: bool,
    /// 802.11ac (VHT).
    vht: bool,
    /// 802.11ax (HE).
    he: bool,
}

#[derive(Builder, Clone, CopyGetters, Debug, Default, Deserialize, Getters, Serialize, Setters)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(default)]
/// A network interface as discovered on the host. Keyed by its kernel name in
/// the discovery graph.
pub struct Interface {
    #[get = "pub"]
    /// Kernel-assigned interface name, stable within one invocation.
    name: String,

    #[getset(get = "pub", set = "pub")]
    /// Canonical uppercase colon-separated MAC address.
    mac: String,

    #[getset(get_copy = "pub", set = "pub")]
    /// Administrative up state.
    is_up: bool,

    #[getset(get = "pub", set = "pub")]
    /// Primary IPv4 address in CIDR notation, when assigned.
    ip_address: Option<String>,

    #[get = "pub"]
    /// Kernel driver name from ethtool.
    driver: Option<String>,

    #[get = "pub"]
    /// Wiphy identifier for wireless interfaces, e.g. `0` for phy0.
    wiphy: Option<String>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Current operating mode.
    mode: Mode,

    #[getset(get = "pub", set = "pub")]
    /// Associated SSID, for wireless interfaces in managed or AP mode.
    ssid: Option<String>,

    #[get = "pub"]
    /// Transmit power as reported by iw, e.g. `22.00 dBm`.
    tx_power: Option<String>,

    #[getset(get = "pub", set = "pub")]
    /// Channel and frequency as reported by iw.
    channel_frequency: Option<String>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Whether the interface is backed by a wireless driver.
    is_wireless: bool,

    #[getset(get_copy = "pub", set = "pub")]
    /// Wiphy-derived capability flags.
    capabilities: Capabilities,
}

impl Interface {
    /// Check the record invariants before it enters the discovery graph.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("interface name is empty");
        }
        if self.mac.is_empty() {
            bail!("interface {} has an empty MAC", self.name);
        }
        if matches!(self.mode, Mode::Monitor | Mode::Ap) && !self.is_wireless {
            bail!(
                "interface {} reports mode {} but is not wireless",
                self.name,
                self.mode
            );
        }
        Ok(())
    }
}
