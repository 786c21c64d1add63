//! Credential verification against the real access point.
//!
//! Spins up an ephemeral NetworkManager connection profile on a managed-mode
//! interface and classifies the outcome: a clean `nmcli con up` means the
//! password is valid; a timeout or non-zero exit means it is not. The profile
//! is always deleted and NetworkManager management restored afterwards.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    state::unix_now,
};
use anyhow::Result;
use derive_builder::Builder;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time;

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Verifies captured Wi-Fi credentials through nmcli.
pub struct CredentialVerifier {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,
}

impl Default for CredentialVerifier {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
        }
    }
}

impl CredentialVerifier {
    /// Attempt to join `ssid` with `password` on `interface`. Returns whether
    /// the connection came up within `timeout`.
    pub async fn verify(
        &self,
        interface: &str,
        ssid: &str,
        password: &str,
        bssid: Option<&str>,
        timeout: Duration,
    ) -> Result<bool> {
        info!("Verifying captured password for '{}' on {}", ssid, interface);

        let mut we_disabled_nm = false;
        let managed = self
            .exec
            .run_unchecked(
                &argv(["nmcli", "-g", "GENERAL.NM-MANAGED", "dev", "show", interface]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        if managed.trim().eq_ignore_ascii_case("yes") {
            debug!("Releasing {} from NetworkManager for the attempt", interface);
            self.exec
                .run_unchecked(
                    &argv(["nmcli", "dev", "disconnect", interface]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
            self.exec
                .run_unchecked(
                    &argv(["nmcli", "dev", "set", interface, "managed", "no"]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
            we_disabled_nm = true;
            time::sleep(Duration::from_secs(1)).await;
        }

        let con_name = format!("capgate_test_{}", unix_now() as u64);
        let valid = self
            .attempt(interface, ssid, password, bssid, &con_name, timeout)
            .await;

        // Ephemeral profile and NM management always come back.
        self.exec
            .run_unchecked(
                &argv(["nmcli", "con", "delete", &con_name]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        if we_disabled_nm {
            self.exec
                .run_unchecked(
                    &argv(["nmcli", "dev", "set", interface, "managed", "yes"]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
        }

        info!(
            "Verification attempt for '{}' finished: {}",
            ssid,
            if valid { "valid" } else { "invalid" }
        );
        Ok(valid)
    }

    async fn attempt(
        &self,
        interface: &str,
        ssid: &str,
        password: &str,
        bssid: Option<&str>,
        con_name: &str,
        timeout: Duration,
    ) -> bool {
        let mut add_cmd = argv([
            "nmcli",
            "con",
            "add",
            "type",
            "wifi",
            "ifname",
            interface,
            "con-name",
            con_name,
            "ssid",
            ssid,
            "wifi-sec.key-mgmt",
            "wpa-psk",
            "wifi-sec.psk",
            password,
        ]);
        if let Some(bssid) = bssid {
            add_cmd.push("bssid".to_string());
            add_cmd.push(bssid.to_string());
        }
        if let Err(e) = self.exec.run(&add_cmd, &ExecOpts::root()).await {
            warn!("Could not create connection profile: {:#}", e);
            return false;
        }

        match self
            .exec
            .run(
                &argv(["nmcli", "con", "up", con_name]),
                &ExecOpts::root_timeout(timeout),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                match e.downcast_ref::<Error>() {
                    Some(Error::CommandTimeout { .. }) => {
                        debug!("Connection attempt timed out, treating as bad password");
                    }
                    _ => {
                        debug!("Connection attempt failed: {:#}", e);
                    }
                }
                false
            }
        }
    }
}
