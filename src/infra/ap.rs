//! Rogue access point lifecycle through hostapd.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    schema::{canonical_mac, Mode},
    state::AppState,
    supervise::Helper,
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    time::Duration,
};
use tokio::time;

/// How long hostapd gets to prove it came up.
const STARTUP_PROBE: Duration = Duration::from_secs(3);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Builder, Debug)]
#[builder(pattern = "owned", setter(into))]
/// Manages one hostapd instance and its generated configuration file.
pub struct ApManager {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,

    #[builder(default = "\"hostapd\".into()")]
    /// Path to the hostapd binary.
    hostapd_binary: PathBuf,

    #[builder(default = "std::env::temp_dir()")]
    /// Directory for the generated configuration.
    config_dir: PathBuf,

    #[builder(setter(skip))]
    helper: Option<Helper>,

    #[builder(setter(skip))]
    config_path: Option<PathBuf>,
}

impl Default for ApManager {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
            hostapd_binary: "hostapd".into(),
            config_dir: std::env::temp_dir(),
            helper: None,
            config_path: None,
        }
    }
}

/// hostapd hardware mode for a channel: `g` covers 1–14, `a` the rest.
pub fn hw_mode_for_channel(channel: u32) -> &'static str {
    if (1..=14).contains(&channel) {
        "g"
    } else {
        "a"
    }
}

/// Render an open-authentication hostapd configuration.
pub fn generate_hostapd_config(interface: &str, ssid: &str, channel: u32) -> String {
    [
        format!("interface={}", interface),
        "driver=nl80211".to_string(),
        format!("ssid={}", ssid),
        format!("hw_mode={}", hw_mode_for_channel(channel)),
        format!("channel={}", channel),
        "macaddr_acl=0".to_string(),
        "auth_algs=1".to_string(),
        "wmm_enabled=1".to_string(),
        "ignore_broadcast_ssid=0".to_string(),
    ]
    .join("\n")
}

impl ApManager {
    /// Spoof the interface MAC before hosting, recording the new address in
    /// the store.
    pub async fn spoof_mac(&self, state: &AppState, interface: &str, mac: &str) -> Result<()> {
        info!("Spoofing MAC of {} to {}", interface, mac);
        self.exec
            .run_unchecked(
                &argv(["ip", "link", "set", interface, "down"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        self.exec
            .run(
                &argv(["ip", "link", "set", interface, "address", mac]),
                &ExecOpts::root(),
            )
            .await
            .context("set spoofed address")?;
        self.exec
            .run_unchecked(
                &argv(["ip", "link", "set", interface, "up"]),
                &ExecOpts::root_unchecked(),
            )
            .await;

        if let Some(mut iface) = state.interface(interface) {
            iface.set_mac(canonical_mac(mac));
            state.update_interfaces(HashMap::from([(interface.to_string(), iface)]));
        }
        Ok(())
    }

    /// Start hostapd on `interface` with an open AP of the given SSID and
    /// channel. Fails with [`Error::InfraStartupFailed`] when hostapd dies
    /// during the startup probe, carrying its captured stderr.
    pub async fn start_ap(
        &mut self,
        state: &AppState,
        interface: &str,
        ssid: &str,
        channel: u32,
        mac_spoof: Option<&str>,
    ) -> Result<()> {
        info!(
            "Starting AP '{}' on {} (channel {}, hw_mode {})",
            ssid,
            interface,
            channel,
            hw_mode_for_channel(channel)
        );

        if ssid.is_empty() {
            // hostapd versions disagree on empty ssid= lines; refuse up front.
            return Err(Error::InfraStartupFailed(
                "refusing to host an AP with an empty SSID".into(),
            )
            .into());
        }
        let iface = state.interface(interface).ok_or_else(|| {
            Error::InfraStartupFailed(format!("interface {} is not in the store", interface))
        })?;
        if !iface.is_wireless() {
            return Err(Error::InfraStartupFailed(format!(
                "interface {} is not wireless",
                interface
            ))
            .into());
        }
        if iface.mode() == Mode::Monitor {
            return Err(Error::InfraStartupFailed(format!(
                "interface {} is in monitor mode, restore it first",
                interface
            ))
            .into());
        }

        if let Some(mac) = mac_spoof {
            self.spoof_mac(state, interface, mac).await?;
        }

        let config_path = self.config_dir.join(format!("hostapd_{}.conf", interface));
        fs::write(&config_path, generate_hostapd_config(interface, ssid, channel))
            .with_context(|| format!("write hostapd config {}", config_path.display()))?;
        debug!("Generated hostapd config {}", config_path.display());
        self.config_path = Some(config_path.clone());

        let mut helper = Helper::spawn(
            "hostapd",
            &argv([
                self.hostapd_binary.to_string_lossy().as_ref(),
                config_path.to_string_lossy().as_ref(),
            ]),
        )
        .context("spawn hostapd")?;

        time::sleep(STARTUP_PROBE).await;
        if !helper.is_running() {
            let stderr = helper.stderr_tail();
            self.remove_config();
            return Err(Error::InfraStartupFailed(format!(
                "hostapd terminated during startup: {}",
                stderr
            ))
            .into());
        }
        self.helper = Some(helper);

        if let Some(mut iface) = state.interface(interface) {
            iface.set_mode(Mode::Ap);
            iface.set_ssid(Some(ssid.to_string()));
            iface.set_channel_frequency(Some(format!(
                "{} ({} band)",
                channel,
                hw_mode_for_channel(channel)
            )));
            iface.set_is_up(true);
            state.update_interfaces(HashMap::from([(interface.to_string(), iface)]));
        }
        info!("AP '{}' started on {}", ssid, interface);
        Ok(())
    }

    /// Whether the hostapd child is still alive.
    pub fn is_running(&mut self) -> bool {
        self.helper.as_mut().map(Helper::is_running).unwrap_or(false)
    }

    /// Stop hostapd and remove the generated configuration.
    pub async fn stop_ap(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            helper.stop(STOP_GRACE).await;
            info!("hostapd stopped");
        } else {
            debug!("No hostapd process to stop");
        }
        self.remove_config();
    }

    fn remove_config(&mut self) {
        if let Some(path) = self.config_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove hostapd config {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for ApManager {
    fn drop(&mut self) {
        // The helper kills its process group in its own drop.
        self.remove_config();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::ExecMock;
    use crate::schema::interface::InterfaceBuilder;
    use tempfile::TempDir;

    fn state_with_wlan0(mode: Mode) -> Result<AppState> {
        let state = AppState::default();
        state.update_interfaces(HashMap::from([(
            "wlan0".to_string(),
            InterfaceBuilder::default()
                .name("wlan0")
                .mac("D8:CF:61:32:99:A7")
                .is_up(true)
                .is_wireless(true)
                .mode(mode)
                .build()?,
        )]));
        Ok(state)
    }

    #[test]
    fn hw_mode_selection() {
        assert_eq!(hw_mode_for_channel(1), "g");
        assert_eq!(hw_mode_for_channel(14), "g");
        assert_eq!(hw_mode_for_channel(36), "a");
        assert_eq!(hw_mode_for_channel(149), "a");
    }

    #[test]
    fn config_rendering() {
        let config = generate_hostapd_config("wlan0", "example", 6);
        assert!(config.contains("interface=wlan0"));
        assert!(config.contains("driver=nl80211"));
        assert!(config.contains("ssid=example"));
        assert!(config.contains("hw_mode=g"));
        assert!(config.contains("channel=6"));
        assert!(config.contains("auth_algs=1"));
        assert!(!config.contains("wpa="));
    }

    #[tokio::test]
    async fn start_succeeds_with_long_lived_binary() -> Result<()> {
        let dir = TempDir::new()?;
        let state = state_with_wlan0(Mode::Managed)?;
        // `yes <config>` stays alive with a single file argument.
        let mut manager = ApManagerBuilder::default()
            .hostapd_binary(which::which("yes")?)
            .config_dir(dir.path())
            .build()?;

        manager.start_ap(&state, "wlan0", "example", 1, None).await?;
        assert!(manager.is_running());

        let iface = state.interface("wlan0").expect("present");
        assert_eq!(iface.mode(), Mode::Ap);
        assert_eq!(iface.ssid().as_deref(), Some("example"));

        manager.stop_ap().await;
        assert!(!manager.is_running());
        assert!(!dir.path().join("hostapd_wlan0.conf").exists());
        Ok(())
    }

    #[tokio::test]
    async fn start_fails_when_binary_dies() -> Result<()> {
        let dir = TempDir::new()?;
        let state = state_with_wlan0(Mode::Managed)?;
        let mut manager = ApManagerBuilder::default()
            .hostapd_binary(which::which("false")?)
            .config_dir(dir.path())
            .build()?;

        let res = manager.start_ap(&state, "wlan0", "example", 1, None).await;
        let err = res.expect_err("hostapd died");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InfraStartupFailed(_))
        ));
        // Config was removed on the failure path.
        assert!(!dir.path().join("hostapd_wlan0.conf").exists());
        Ok(())
    }

    #[tokio::test]
    async fn start_rejects_monitor_mode_interface() -> Result<()> {
        let state = state_with_wlan0(Mode::Monitor)?;
        let mut manager = ApManagerBuilder::default().build()?;
        let res = manager.start_ap(&state, "wlan0", "example", 1, None).await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn start_rejects_empty_ssid() -> Result<()> {
        let state = state_with_wlan0(Mode::Managed)?;
        let mut manager = ApManagerBuilder::default().build()?;
        let res = manager.start_ap(&state, "wlan0", "", 1, None).await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn spoof_mac_updates_store() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok(""); // down
        mock.push_ok(""); // set address
        mock.push_ok(""); // up

        let state = state_with_wlan0(Mode::Managed)?;
        let manager = ApManagerBuilder::default()
            .exec(Box::new(mock.clone()) as Box<dyn Exec>)
            .build()?;
        manager
            .spoof_mac(&state, "wlan0", "aa:bb:cc:dd:ee:ff")
            .await?;

        assert_eq!(
            state.interface("wlan0").expect("present").mac(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            mock.joined_calls()[1],
            "ip link set wlan0 address aa:bb:cc:dd:ee:ff"
        );
        Ok(())
    }
}
