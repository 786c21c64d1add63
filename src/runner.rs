//! Startup wiring: logging, state seeding, plugin discovery and dispatch.

use crate::{
    config::Config,
    plugin::{builtin_entry_points, PluginLoader},
    scan::{DeviceScanner, InterfaceScanner},
    state::{AppState, RunContext},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use nix::unistd::Uid;
use std::sync::Arc;

/// Runner is the main instance wiring the toolkit together.
pub struct Runner {
    config: Config,
}

impl Runner {
    /// Parse the command line and run.
    pub async fn start() -> Result<()> {
        Self::with_config(Config::parse()).run().await
    }

    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        self.init_logging();

        if !Uid::effective().is_root() {
            warn!("Not running as root; privileged calls will go through sudo");
        }

        let state = Arc::new(AppState::default());
        if let Some(path) = self.config.state_path() {
            if let Err(e) = state.load(path) {
                warn!("Could not load state snapshot: {:#}", e);
            }
        }

        // Seed the discovery graph.
        if let Err(e) = InterfaceScanner::default().scan(&state).await {
            warn!("Interface scan failed: {:#}", e);
        }
        if let Err(e) = DeviceScanner::default().scan_arp_table(&state).await {
            warn!("Device scan failed: {:#}", e);
        }

        let loader = PluginLoader::discover(
            self.config.plugin_dir(),
            builtin_entry_points(&self.config),
        );
        state.set_loaded_plugins(loader.names());

        let ctx = RunContext::new(Arc::clone(&state));
        self.config.populate_context(&ctx);

        let outcome = match self.config.plugin() {
            Some(name) => {
                let success = loader
                    .invoke(name, &ctx, self.config.plugin_args())
                    .await;
                Some((name.clone(), success))
            }
            None => {
                info!("Available plugins:");
                for name in loader.names() {
                    if let Some(manifest) = loader.manifest(&name) {
                        info!(
                            " - {} v{} by {}: {}",
                            manifest.name(),
                            manifest.version(),
                            manifest.author(),
                            manifest.description()
                        );
                    }
                }
                None
            }
        };

        if let Some(path) = self.config.state_path() {
            state
                .save(path)
                .with_context(|| format!("save state snapshot to {}", path.display()))?;
        }

        if let Some((name, success)) = outcome {
            if !success {
                bail!("plugin '{}' reported failure", name);
            }
            info!("Plugin '{}' finished successfully", name);
        }
        Ok(())
    }

    fn init_logging(&self) {
        let _ = env_logger::Builder::new()
            .filter_level(self.config.log_level())
            .try_init();
    }
}
