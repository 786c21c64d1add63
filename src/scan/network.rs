//! Wi-Fi network scanning through airodump-ng.
//!
//! airodump's CSV is not RFC-4180: fields are whitespace-padded and two
//! sections (access points, then stations) are separated by a `Station MAC`
//! sentinel row. The parser here is purpose-built and total; malformed rows
//! are dropped with a debug log.

use crate::{schema::canonical_mac, supervise::Helper};
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::{debug, info, warn};
use std::{fs, path::PathBuf, time::Duration};
use tempfile::TempDir;
use tokio::time;

/// Grace period for airodump-ng between SIGTERM and SIGKILL.
const AIRODUMP_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, CopyGetters, Debug, Getters)]
/// One access point row from an airodump scan.
pub struct AccessPoint {
    #[get = "pub"]
    /// BSSID in canonical form.
    bssid: String,

    #[get = "pub"]
    /// Channel as reported (kept as text, airodump emits ` -1` for drifting APs).
    channel: String,

    #[get = "pub"]
    /// Privacy column, e.g. `WPA2 WPA`.
    privacy: String,

    #[get_copy = "pub"]
    /// Signal power when it parses as an integer.
    power: Option<i32>,

    #[get = "pub"]
    /// Display ESSID; hidden networks render as `<Hidden SSID>`.
    essid: String,

    #[get = "pub"]
    /// Raw ESSID column, empty for hidden networks.
    essid_raw: String,
}

impl AccessPoint {
    /// Whether the ESSID was absent or NUL-ridden.
    pub fn hidden(&self) -> bool {
        self.essid == HIDDEN_SSID
    }
}

/// Placeholder for networks which do not broadcast a usable ESSID.
pub const HIDDEN_SSID: &str = "<Hidden SSID>";

#[derive(Builder, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Drives airodump-ng scans on a monitor-mode interface.
pub struct NetworkScanner {
    #[builder(default = "\"airodump-ng\".into()")]
    /// Path to the airodump-ng binary.
    airodump_binary: PathBuf,
}

impl Default for NetworkScanner {
    fn default() -> Self {
        Self {
            airodump_binary: "airodump-ng".into(),
        }
    }
}

impl NetworkScanner {
    /// Scan for `duration`, keeping networks whose privacy column contains
    /// `security_filter` (case-insensitive), sorted by power descending.
    ///
    /// Ctrl-C stops the scan early and surfaces the partial result. All
    /// airodump artifacts live in a scan-scoped temp directory removed on
    /// every exit path.
    pub async fn scan(
        &self,
        monitor_iface: &str,
        duration: Duration,
        security_filter: &str,
    ) -> Result<Vec<AccessPoint>> {
        let workdir = TempDir::new().context("create scan directory")?;
        let prefix = workdir.path().join("scan");
        let csv_path = workdir.path().join("scan-01.csv");

        info!(
            "Scanning on {} for {:?} (filter: {})",
            monitor_iface, duration, security_filter
        );
        let mut helper = Helper::spawn(
            "airodump-ng",
            &[
                self.airodump_binary.to_string_lossy().to_string(),
                "--output-format".into(),
                "csv".into(),
                "--write".into(),
                prefix.to_string_lossy().to_string(),
                "--write-interval".into(),
                "1".into(),
                monitor_iface.to_string(),
            ],
        )
        .context("spawn airodump-ng")?;

        let mut remaining = duration.as_secs();
        while remaining > 0 {
            if !helper.is_running() {
                warn!("airodump-ng terminated prematurely");
                break;
            }
            tokio::select! {
                _ = time::sleep(Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Scan interrupted, stopping airodump-ng");
                    break;
                }
            }
            remaining -= 1;
        }
        helper.stop(AIRODUMP_STOP_GRACE).await;

        let contents = match fs::read_to_string(&csv_path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("No scan output at {}: {}", csv_path.display(), e);
                return Ok(vec![]);
            }
        };
        let networks = parse_airodump_csv(&contents, security_filter);
        if networks.is_empty() {
            warn!("No networks matching filter '{}' found", security_filter);
        }
        Ok(networks)
    }
}

/// Parse the AP section of an airodump CSV. Per row: BSSID (col 0),
/// channel (3), privacy (5), power (8), ESSID (13). Returns the rows
/// matching the privacy filter, sorted by power descending with
/// non-integer powers stably at the end.
pub fn parse_airodump_csv(contents: &str, security_filter: &str) -> Vec<AccessPoint> {
    let filter = security_filter.to_uppercase();
    let mut networks = Vec::new();

    for line in contents.lines() {
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        let first = columns.first().copied().unwrap_or("");
        if first.is_empty() {
            continue;
        }
        if first == "Station MAC" {
            // Start of the station section; nothing below is an AP.
            break;
        }
        if first == "BSSID" {
            continue;
        }
        if columns.len() < 9 || !first.contains(':') {
            debug!("Skipping malformed airodump row: {}", line);
            continue;
        }

        let bssid = canonical_mac(first);
        let channel = columns[3].to_string();
        let privacy = columns[5].to_string();
        let power = columns[8].replace(',', "").parse::<i32>().ok();

        let essid_raw = columns.get(13).copied().unwrap_or("").to_string();
        let essid = if essid_raw.is_empty() || essid_raw.contains('\u{0}') {
            HIDDEN_SSID.to_string()
        } else {
            essid_raw.clone()
        };

        if !privacy.to_uppercase().contains(&filter) {
            continue;
        }
        networks.push(AccessPoint {
            bssid,
            channel,
            privacy,
            power,
            essid,
            essid_raw,
        });
    }

    networks.sort_by_key(|n| (n.power.is_none(), std::cmp::Reverse(n.power.unwrap_or(i32::MIN))));
    networks
}
