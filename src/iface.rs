//! Reversible wireless interface mode control.
//!
//! The controller drives the managed ↔ monitor transition, including the
//! NetworkManager hand-off. Enabling monitor mode may rename the interface
//! (airmon-ng VIFs); the restore path handles both the renamed and the
//! in-place case. Every restore sub-step is best-effort and never raises.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    schema::{interface::InterfaceBuilder, Interface, Mode},
    state::AppState,
};
use anyhow::Result;
use derive_builder::Builder;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time;

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Low-level control of wireless interface modes.
pub struct InterfaceController {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,
}

impl Default for InterfaceController {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
        }
    }
}

impl InterfaceController {
    /// Whether NetworkManager currently manages `name`.
    pub async fn nm_managed(&self, name: &str) -> bool {
        let output = self
            .exec
            .run_unchecked(
                &argv(["nmcli", "-g", "GENERAL.NM-MANAGED", "dev", "show", name]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        output.trim().eq_ignore_ascii_case("yes")
    }

    /// Disconnect `name` and take it away from NetworkManager.
    pub async fn nm_release(&self, name: &str) {
        self.exec
            .run_unchecked(
                &argv(["nmcli", "dev", "disconnect", name]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        self.exec
            .run_unchecked(
                &argv(["nmcli", "dev", "set", name, "managed", "no"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        // Give NetworkManager a moment to let go of the device.
        time::sleep(Duration::from_secs(1)).await;
    }

    /// Hand `name` back to NetworkManager.
    pub async fn nm_restore(&self, name: &str) {
        self.exec
            .run_unchecked(
                &argv(["nmcli", "dev", "set", name, "managed", "yes"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
    }

    /// Put `name` into monitor mode, wresting it from NetworkManager first
    /// when needed.
    ///
    /// Returns the resulting interface name (airmon-ng may create a renamed
    /// VIF) and whether NetworkManager management was disabled by this call.
    /// On total failure NetworkManager management is restored before the
    /// [`Error::MonitorModeUnavailable`] surfaces.
    pub async fn enable_monitor_mode(
        &self,
        state: &AppState,
        name: &str,
    ) -> Result<(String, bool)> {
        info!("Enabling monitor mode on {}", name);

        let mut we_disabled_nm = false;
        if self.nm_managed(name).await {
            info!("NetworkManager is managing {}, releasing it", name);
            self.nm_release(name).await;
            we_disabled_nm = true;
        }

        // Path A: the plain ip/iw transition.
        match self.monitor_via_iw(name).await {
            Ok(()) => {
                self.record_monitor(state, name, name);
                info!("Monitor mode active on {} via ip/iw", name);
                return Ok((name.to_string(), we_disabled_nm));
            }
            Err(e) => {
                debug!("ip/iw monitor transition failed for {}: {:#}", name, e);
            }
        }

        // Path B: airmon-ng, which may rename the interface.
        match self.monitor_via_airmon(name).await {
            Ok(vif) => {
                self.record_monitor(state, name, &vif);
                info!("Monitor mode active on {} via airmon-ng", vif);
                Ok((vif, we_disabled_nm))
            }
            Err(e) => {
                warn!("airmon-ng fallback failed for {}: {:#}", name, e);
                if we_disabled_nm {
                    self.nm_restore(name).await;
                }
                Err(Error::MonitorModeUnavailable {
                    interface: name.to_string(),
                    reason: crate::error::chain(e),
                }
                .into())
            }
        }
    }

    async fn monitor_via_iw(&self, name: &str) -> Result<()> {
        self.exec
            .run(&argv(["ip", "link", "set", name, "down"]), &ExecOpts::root())
            .await?;
        self.exec
            .run(
                &argv(["iw", "dev", name, "set", "type", "monitor"]),
                &ExecOpts::root(),
            )
            .await?;
        self.exec
            .run(&argv(["ip", "link", "set", name, "up"]), &ExecOpts::root())
            .await?;

        if self.is_monitor(name).await {
            Ok(())
        } else {
            anyhow::bail!("{} did not report type monitor", name)
        }
    }

    async fn monitor_via_airmon(&self, name: &str) -> Result<String> {
        let output = self
            .exec
            .run(&argv(["airmon-ng", "start", name]), &ExecOpts::root())
            .await?;

        if let Some(vif) = parse_airmon_vif(&output, name) {
            if self.is_monitor(&vif).await {
                return Ok(vif);
            }
            anyhow::bail!("airmon-ng reported {} but it is not in monitor mode", vif);
        }
        // Some airmon builds flip the original interface without a rename.
        if self.is_monitor(name).await {
            return Ok(name.to_string());
        }
        anyhow::bail!("airmon-ng reported no monitor VIF")
    }

    async fn is_monitor(&self, name: &str) -> bool {
        let info = self
            .exec
            .run_unchecked(
                &argv(["iw", "dev", name, "info"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        info.contains("type monitor")
    }

    /// Mutate the store entry behind a successful monitor transition.
    fn record_monitor(&self, state: &AppState, original: &str, current: &str) {
        let Some(iface) = state.interface(original) else {
            return;
        };
        let mut updated = if original == current {
            iface
        } else {
            // A renamed VIF gets its own record, carrying the wiphy data over.
            match InterfaceBuilder::default()
                .name(current.to_string())
                .mac(iface.mac().clone())
                .driver(iface.driver().clone())
                .wiphy(iface.wiphy().clone())
                .is_wireless(true)
                .capabilities(iface.capabilities())
                .build()
            {
                Ok(vif) => vif,
                Err(e) => {
                    warn!("Could not record monitor VIF {}: {}", current, e);
                    return;
                }
            }
        };
        updated.set_mode(Mode::Monitor);
        updated.set_is_up(true);
        state.update_interfaces(std::collections::HashMap::from([(
            current.to_string(),
            updated,
        )]));
    }

    /// Restore an interface from monitor mode. Every sub-step is best-effort;
    /// this never raises, even against a hostile NetworkManager.
    pub async fn restore_interface_state(
        &self,
        state: &AppState,
        original_name: &str,
        we_disabled_nm: bool,
        current_name: &str,
    ) {
        info!("Restoring interface state of {}", current_name);

        self.exec
            .run_unchecked(
                &argv(["iw", "dev", current_name, "set", "type", "managed"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        self.exec
            .run_unchecked(
                &argv(["ip", "link", "set", current_name, "up"]),
                &ExecOpts::root_unchecked(),
            )
            .await;

        if let Some(mut iface) = state.interface(current_name) {
            iface.set_mode(Mode::Managed);
            iface.set_is_up(true);
            state.update_interfaces(std::collections::HashMap::from([(
                current_name.to_string(),
                iface,
            )]));
        }

        if we_disabled_nm {
            debug!("Returning {} to NetworkManager", original_name);
            self.nm_restore(original_name).await;
        }

        // The original physical interface comes back up even when airmon
        // renamed the VIF.
        if original_name != current_name {
            self.exec
                .run_unchecked(
                    &argv(["ip", "link", "set", original_name, "up"]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
        }

        info!("Interface restore for {} finished", current_name);
    }
}

/// Extract the monitor VIF name from airmon-ng output. Understands both the
/// `(mac80211 monitor mode vif enabled for [phy0]wlan0 on [phy0]wlan0mon)`
/// and the bare `monitor mode enabled on mon0` forms.
fn parse_airmon_vif(output: &str, original: &str) -> Option<String> {
    for line in output.lines() {
        if !line.contains("monitor mode") {
            continue;
        }
        if let Some(idx) = line.rfind(" on ") {
            let rest = line[idx + 4..].trim().trim_end_matches(')').trim();
            let vif = rest.rsplit(']').next().unwrap_or(rest).trim();
            if !vif.is_empty() {
                return Some(vif.to_string());
            }
        }
    }
    // Fall back to any wlanNmon-style token derived from the original name.
    output
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .find(|t| t.starts_with(original) && t.ends_with("mon"))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::ExecMock;
    use crate::schema::interface::CapabilitiesBuilder;
    use std::collections::HashMap;

    fn seeded_state() -> Result<AppState> {
        let state = AppState::default();
        state.update_interfaces(HashMap::from([(
            "wlan0".to_string(),
            InterfaceBuilder::default()
                .name("wlan0")
                .mac("D8:CF:61:32:99:A7")
                .is_up(true)
                .is_wireless(true)
                .mode(Mode::Managed)
                .capabilities(CapabilitiesBuilder::default().monitor(true).managed(true).build()?)
                .build()?,
        )]));
        Ok(state)
    }

    fn controller(mock: &ExecMock) -> Result<InterfaceController> {
        Ok(InterfaceControllerBuilder::default()
            .exec(Box::new(mock.clone()) as Box<dyn Exec>)
            .build()?)
    }

    #[tokio::test]
    async fn enable_monitor_iw_path_with_nm_handoff() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok("yes"); // nmcli managed probe
        mock.push_ok(""); // nmcli dev disconnect
        mock.push_ok(""); // nmcli dev set managed no
        mock.push_ok(""); // ip link down
        mock.push_ok(""); // iw set type monitor
        mock.push_ok(""); // ip link up
        mock.push_ok("Interface wlan0\n\ttype monitor\n\twiphy 0"); // verify

        let state = seeded_state()?;
        let (name, we_disabled_nm) = controller(&mock)?
            .enable_monitor_mode(&state, "wlan0")
            .await?;

        assert_eq!(name, "wlan0");
        assert!(we_disabled_nm);
        let iface = state.interface("wlan0").expect("interface present");
        assert_eq!(iface.mode(), Mode::Monitor);

        let calls = mock.joined_calls();
        assert_eq!(calls[1], "nmcli dev disconnect wlan0");
        assert_eq!(calls[2], "nmcli dev set wlan0 managed no");
        Ok(())
    }

    #[tokio::test]
    async fn enable_monitor_airmon_fallback_with_rename() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok("no"); // nmcli probe: unmanaged
        mock.push_ok(""); // ip link down
        mock.push_failure(1); // iw set type monitor fails -> path B
        mock.push_ok(
            "PHY\tInterface\tDriver\tChipset\n\n\t\t(mac80211 monitor mode vif enabled for [phy0]wlan0 on [phy0]wlan0mon)",
        ); // airmon-ng start
        mock.push_ok("Interface wlan0mon\n\ttype monitor\n\twiphy 0"); // verify vif

        let state = seeded_state()?;
        let (name, we_disabled_nm) = controller(&mock)?
            .enable_monitor_mode(&state, "wlan0")
            .await?;

        assert_eq!(name, "wlan0mon");
        assert!(!we_disabled_nm);
        let vif = state.interface("wlan0mon").expect("vif recorded");
        assert_eq!(vif.mode(), Mode::Monitor);
        assert_eq!(vif.mac(), "D8:CF:61:32:99:A7");
        Ok(())
    }

    #[tokio::test]
    async fn enable_monitor_total_failure_restores_nm() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok("yes"); // nmcli probe
        mock.push_ok(""); // disconnect
        mock.push_ok(""); // set managed no
        mock.push_failure(1); // ip link down fails -> path B
        mock.push_failure(1); // airmon-ng start fails

        let state = seeded_state()?;
        let res = controller(&mock)?.enable_monitor_mode(&state, "wlan0").await;

        let err = res.expect_err("both paths failed");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MonitorModeUnavailable { .. })
        ));
        // NetworkManager management came back before the error surfaced.
        assert_eq!(
            mock.joined_calls().last().map(String::as_str),
            Some("nmcli dev set wlan0 managed yes")
        );
        // The store was not flipped to monitor.
        assert_eq!(
            state.interface("wlan0").expect("present").mode(),
            Mode::Managed
        );
        Ok(())
    }

    #[tokio::test]
    async fn restore_never_raises_and_updates_store() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_failure(1); // iw set type managed fails, still best-effort
        mock.push_ok(""); // ip link up
        mock.push_ok(""); // nmcli set managed yes

        let state = seeded_state()?;
        {
            let mut iface = state.interface("wlan0").expect("present");
            iface.set_mode(Mode::Monitor);
            state.update_interfaces(HashMap::from([("wlan0".to_string(), iface)]));
        }

        controller(&mock)?
            .restore_interface_state(&state, "wlan0", true, "wlan0")
            .await;

        assert_eq!(
            state.interface("wlan0").expect("present").mode(),
            Mode::Managed
        );
        assert_eq!(
            mock.joined_calls().last().map(String::as_str),
            Some("nmcli dev set wlan0 managed yes")
        );
        Ok(())
    }

    #[test]
    fn airmon_vif_parsing() {
        let bracketed =
            "\t\t(mac80211 monitor mode vif enabled for [phy0]wlan0 on [phy0]wlan0mon)";
        assert_eq!(
            parse_airmon_vif(bracketed, "wlan0").as_deref(),
            Some("wlan0mon")
        );

        let bare = "monitor mode enabled on mon0";
        assert_eq!(parse_airmon_vif(bare, "wlan0").as_deref(), Some("mon0"));

        let token_only = "wlan0mon created";
        assert_eq!(
            parse_airmon_vif(token_only, "wlan0").as_deref(),
            Some("wlan0mon")
        );

        assert_eq!(parse_airmon_vif("nothing useful", "wlan0"), None);
    }
}
