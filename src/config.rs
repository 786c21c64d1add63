//! Configuration related structures.

use crate::state::{context::keys, RunContext};
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Builder, Clone, CopyGetters, Debug, Deserialize, Getters, Parser, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[command(
    version,
    about = "Plugin-driven wireless offensive toolkit",
    after_help = "The toolkit must run as root and expects the aircrack suite, \
                  hostapd, dnsmasq, iw, ip, nmcli and iptables on PATH."
)]
pub struct Config {
    #[get_copy = "pub"]
    #[arg(
        default_value("info"),
        env("SKYLURE_LOG_LEVEL"),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get = "pub"]
    #[arg(default_value("plugins"), env("SKYLURE_PLUGIN_DIR"), long("plugin-dir"))]
    /// Directory scanned for plugin manifests
    plugin_dir: PathBuf,

    #[get = "pub"]
    #[arg(default_value("/tmp"), env("SKYLURE_WORK_DIR"), long("work-dir"))]
    /// Directory for generated configs and capture artifacts
    work_dir: PathBuf,

    #[get = "pub"]
    #[arg(long("state-path"), env("SKYLURE_STATE_PATH"))]
    /// Optional path for the state snapshot loaded at startup and saved at exit
    state_path: Option<PathBuf>,

    #[get = "pub"]
    #[arg(long("credentials-file"))]
    /// Path of the captured-credentials JSONL file (defaults under the work dir)
    credentials_file: Option<PathBuf>,

    #[get = "pub"]
    #[arg(default_value("templates/portal"), long("template-dir"))]
    /// Directory holding the captive portal pages
    template_dir: PathBuf,

    #[get = "pub"]
    #[arg(default_value("wordlists"), long("wordlist-dir"))]
    /// Directory holding the bundled wordlists
    wordlist_dir: PathBuf,

    #[get_copy = "pub"]
    #[builder(default = "15")]
    #[arg(default_value("15"), long("scan-duration"), value_name("SECONDS"))]
    /// How long airodump-ng scans for networks
    scan_duration: u64,

    #[get_copy = "pub"]
    #[builder(default = "30")]
    #[arg(default_value("30"), long("capture-duration"), value_name("SECONDS"))]
    /// How long the handshake capture runs
    capture_duration: u64,

    #[get_copy = "pub"]
    #[builder(default = "5")]
    #[arg(default_value("5"), long("deauth-count"))]
    /// Number of deauthentication frames sent per burst
    deauth_count: u32,

    #[get_copy = "pub"]
    #[builder(default = "10")]
    #[arg(default_value("10"), long("verify-timeout"), value_name("SECONDS"))]
    /// Timeout for one credential verification attempt
    verify_timeout: u64,

    #[get_copy = "pub"]
    #[builder(default = "300")]
    #[arg(default_value("300"), long("lure-timeout"), value_name("SECONDS"))]
    /// How long the rogue AP waits for a credential submission
    lure_timeout: u64,

    #[get = "pub"]
    #[builder(default = "\"WPA\".to_string()")]
    #[arg(default_value("WPA"), long("security-filter"))]
    /// Keep only networks whose privacy column contains this substring
    security_filter: String,

    #[get = "pub"]
    #[builder(default = "\"10.0.0.1/24\".to_string()")]
    #[arg(default_value("10.0.0.1/24"), long("gateway-cidr"))]
    /// Address assigned to the rogue AP interface
    gateway_cidr: String,

    #[get_copy = "pub"]
    #[arg(long("auto-select"))]
    /// Pick interfaces and the strongest target without prompting
    auto_select: bool,

    #[get_copy = "pub"]
    #[arg(long("mock-mode"), hide(true))]
    /// Skip privileged operations, for rehearsal runs
    mock_mode: bool,

    #[get = "pub"]
    #[arg(long("ap-iface"))]
    /// Interface hosting the rogue AP
    ap_iface: Option<String>,

    #[get = "pub"]
    #[arg(long("deauth-iface"))]
    /// Interface used for monitor-mode scanning and deauthentication
    deauth_iface: Option<String>,

    #[get = "pub"]
    #[arg(long("verify-iface"))]
    /// Interface used for credential verification
    verify_iface: Option<String>,

    #[get = "pub"]
    #[arg(long("internet-iface"))]
    /// Uplink interface used for NAT
    internet_iface: Option<String>,

    #[get = "pub"]
    #[arg(long("target-bssid"))]
    /// BSSID of the target access point
    target_bssid: Option<String>,

    #[get = "pub"]
    #[arg(long("target-ssid"))]
    /// SSID of the target access point
    target_ssid: Option<String>,

    #[get_copy = "pub"]
    #[arg(long("target-channel"))]
    /// Channel of the target access point
    target_channel: Option<u32>,

    #[get = "pub"]
    #[arg(long("wordlist"))]
    /// Wordlist path or stem for the cracking phase
    wordlist: Option<String>,

    #[get = "pub"]
    #[arg(value_name("PLUGIN"))]
    /// Name of the plugin to invoke
    plugin: Option<String>,

    #[get = "pub"]
    #[arg(trailing_var_arg(true), value_name("ARGS"))]
    /// Arguments forwarded to the plugin
    plugin_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            plugin_dir: "plugins".into(),
            work_dir: "/tmp".into(),
            state_path: None,
            credentials_file: None,
            template_dir: "templates/portal".into(),
            wordlist_dir: "wordlists".into(),
            scan_duration: 15,
            capture_duration: 30,
            deauth_count: 5,
            verify_timeout: 10,
            lure_timeout: 300,
            security_filter: "WPA".into(),
            gateway_cidr: "10.0.0.1/24".into(),
            auto_select: false,
            mock_mode: false,
            ap_iface: None,
            deauth_iface: None,
            verify_iface: None,
            internet_iface: None,
            target_bssid: None,
            target_ssid: None,
            target_channel: None,
            wordlist: None,
            plugin: None,
            plugin_args: vec![],
        }
    }
}

impl Config {
    /// The captured-credentials file, defaulting under the work directory.
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join("credentials.jsonl"))
    }

    /// Seed a run context with the workflow-relevant settings.
    pub fn populate_context(&self, ctx: &RunContext) {
        ctx.set(keys::AUTO_SELECT, self.auto_select);
        ctx.set(keys::MOCK_MODE, self.mock_mode);
        ctx.set(keys::SCAN_DURATION, self.scan_duration);
        ctx.set(keys::CAPTURE_DURATION, self.capture_duration);
        ctx.set(keys::DEAUTH_COUNT, self.deauth_count as u64);
        ctx.set(keys::VERIFY_TIMEOUT, self.verify_timeout);
        ctx.set(keys::LURE_TIMEOUT, self.lure_timeout);
        ctx.set(keys::SECURITY_FILTER, self.security_filter.as_str());
        if let Some(v) = &self.ap_iface {
            ctx.set(keys::AP_IFACE, v.as_str());
        }
        if let Some(v) = &self.deauth_iface {
            ctx.set(keys::DEAUTH_IFACE, v.as_str());
        }
        if let Some(v) = &self.verify_iface {
            ctx.set(keys::VERIFY_IFACE, v.as_str());
        }
        if let Some(v) = &self.internet_iface {
            ctx.set(keys::INTERNET_IFACE, v.as_str());
        }
        if let Some(v) = &self.target_bssid {
            ctx.set(keys::TARGET_BSSID, v.as_str());
        }
        if let Some(v) = &self.target_ssid {
            ctx.set(keys::TARGET_SSID, v.as_str());
        }
        if let Some(v) = self.target_channel {
            ctx.set(keys::TARGET_CHANNEL, v as u64);
        }
        if let Some(v) = &self.wordlist {
            ctx.set(keys::WORDLIST, v.as_str());
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::state::AppState;
    use anyhow::Result;
    use std::sync::Arc;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.scan_duration(), 15);
        assert_eq!(c.lure_timeout(), 300);
        assert_eq!(c.security_filter(), "WPA");
        assert_eq!(c.gateway_cidr(), "10.0.0.1/24");
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .scan_duration(5u64)
            .target_ssid(Some("example".to_string()))
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.scan_duration(), 5);
        assert_eq!(c.target_ssid().as_deref(), Some("example"));
        Ok(())
    }

    #[test]
    fn parse_cli_args() -> Result<()> {
        let c = Config::try_parse_from([
            "skylure",
            "--auto-select",
            "--target-bssid",
            "D8:CF:61:32:99:A7",
            "--target-channel",
            "1",
            "run-evil-twin",
        ])?;
        assert!(c.auto_select());
        assert_eq!(c.target_bssid().as_deref(), Some("D8:CF:61:32:99:A7"));
        assert_eq!(c.target_channel(), Some(1));
        assert_eq!(c.plugin().as_deref(), Some("run-evil-twin"));
        Ok(())
    }

    #[test]
    fn credentials_path_defaults_under_work_dir() {
        let c = Config::default();
        assert_eq!(
            c.credentials_path(),
            PathBuf::from("/tmp/credentials.jsonl")
        );
    }

    #[test]
    fn populate_context_seeds_keys() {
        let c = Config::try_parse_from([
            "skylure",
            "--ap-iface",
            "wlan0",
            "--lure-timeout",
            "60",
        ])
        .expect("parse");
        let ctx = RunContext::new(Arc::new(AppState::default()));
        c.populate_context(&ctx);

        assert_eq!(ctx.get_str(keys::AP_IFACE).as_deref(), Some("wlan0"));
        assert_eq!(ctx.get_u64(keys::LURE_TIMEOUT), Some(60));
        assert!(ctx.get(keys::TARGET_BSSID).is_none());
    }
}
