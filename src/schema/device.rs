//! Discovered network device record.

use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};

#[derive(Builder, Clone, CopyGetters, Debug, Default, Deserialize, Getters, Serialize, Setters)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(default)]
/// A device observed on the network, keyed by MAC in the discovery graph.
/// Devices accumulate over a run and are never removed.
pub struct Device {
    #[get = "pub"]
    /// Canonical uppercase colon-separated MAC address.
    mac: String,

    #[getset(get = "pub", set = "pub")]
    /// Last known IPv4 address.
    ip: Option<String>,

    #[getset(get = "pub", set = "pub")]
    /// Resolved hostname, when known.
    hostname: Option<String>,

    #[getset(get = "pub", set = "pub")]
    /// OUI vendor, when known.
    vendor: Option<String>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Signal strength in dBm, for devices seen over the air.
    signal_strength: Option<i32>,

    #[getset(get_copy = "pub", set = "pub")]
    /// Unix timestamp of the most recent observation.
    last_seen: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn build_device() -> Result<()> {
        let device = DeviceBuilder::default()
            .mac("D8:CF:61:32:99:A7")
            .ip(Some("192.168.1.10".to_string()))
            .last_seen(1700000000.5)
            .build()?;

        assert_eq!(device.mac(), "D8:CF:61:32:99:A7");
        assert_eq!(device.ip().as_deref(), Some("192.168.1.10"));
        assert!(device.vendor().is_none());
        Ok(())
    }

    #[test]
    fn serde_skips_nothing_by_default() -> Result<()> {
        let device = DeviceBuilder::default().mac("AA:BB:CC:DD:EE:FF").build()?;
        let json = serde_json::to_string(&device)?;
        let back: Device = serde_json::from_str(&json)?;
        assert_eq!(back.mac(), "AA:BB:CC:DD:EE:FF");
        Ok(())
    }
}
