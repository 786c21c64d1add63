//! Manifest-driven plugin discovery and invocation.
//!
//! Each plugin directory supplies a `manifest.json` with the required
//! metadata; the entry point is the registered implementation of the same
//! name. Plugins missing either side are skipped with a warning. `invoke`
//! converts every raised failure into a logged `false`.

pub mod evil_twin;
pub mod jammer;
pub mod wifi_crack;

pub use evil_twin::EvilTwinPlugin;
pub use jammer::JammerPlugin;
pub use wifi_crack::WifiCrackPlugin;

use crate::{config::Config, error::chain, state::RunContext};
use anyhow::Result;
use async_trait::async_trait;
use getset::Getters;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, fs, path::Path, sync::Arc};

/// File name of the per-plugin manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, Deserialize, Getters, Serialize)]
#[getset(get = "pub")]
/// Required plugin metadata.
pub struct Manifest {
    name: String,
    version: String,
    author: String,
    description: String,
}

#[async_trait]
/// A plugin entry point: `run` returns whether the workflow succeeded.
pub trait Plugin: Send + Sync {
    /// The name matched against the manifest.
    fn name(&self) -> &str;

    /// Execute the workflow against the run context.
    async fn run(&self, ctx: &RunContext, args: &[String]) -> Result<bool>;
}

struct LoadedPlugin {
    manifest: Manifest,
    entry: Arc<dyn Plugin>,
}

/// The discovered plugin set.
#[derive(Default)]
pub struct PluginLoader {
    plugins: HashMap<String, LoadedPlugin>,
}

/// The entry points compiled into this binary.
pub fn builtin_entry_points(config: &Config) -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(EvilTwinPlugin::new(config.clone())),
        Arc::new(WifiCrackPlugin::new(config.clone())),
        Arc::new(JammerPlugin::new(config.clone())),
    ]
}

impl PluginLoader {
    /// Discover plugins under `plugin_dir`, pairing each manifest with its
    /// registered entry point.
    pub fn discover(plugin_dir: &Path, entry_points: Vec<Arc<dyn Plugin>>) -> Self {
        let mut by_name: HashMap<String, Arc<dyn Plugin>> = entry_points
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        let mut plugins = HashMap::new();

        let entries = match fs::read_dir(plugin_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Plugin directory {} is not readable: {}",
                    plugin_dir.display(),
                    e
                );
                return Self { plugins };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILE);
            let manifest: Manifest = match fs::read_to_string(&manifest_path)
                .map_err(anyhow::Error::new)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::new))
            {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(
                        "Skipping {}: no usable manifest ({:#})",
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            let entry_point = match by_name.remove(manifest.name()) {
                Some(entry_point) => entry_point,
                None => {
                    warn!(
                        "Skipping {}: no entry point named '{}'",
                        path.display(),
                        manifest.name()
                    );
                    continue;
                }
            };
            info!("Loaded plugin: {} v{}", manifest.name(), manifest.version());
            plugins.insert(
                manifest.name().clone(),
                LoadedPlugin {
                    manifest,
                    entry: entry_point,
                },
            );
        }

        Self { plugins }
    }

    /// Build a loader directly from entry points, with synthesized
    /// manifests. Used where no plugin directory is present.
    pub fn from_entry_points(entry_points: Vec<Arc<dyn Plugin>>) -> Self {
        let plugins = entry_points
            .into_iter()
            .map(|entry| {
                let manifest = Manifest {
                    name: entry.name().to_string(),
                    version: "0.0".to_string(),
                    author: "builtin".to_string(),
                    description: String::new(),
                };
                (
                    entry.name().to_string(),
                    LoadedPlugin { manifest, entry },
                )
            })
            .collect();
        Self { plugins }
    }

    /// Names of the loaded plugins, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// The manifest of a loaded plugin.
    pub fn manifest(&self, name: &str) -> Option<&Manifest> {
        self.plugins.get(name).map(|p| &p.manifest)
    }

    /// Run a plugin. Failures raised inside the plugin are logged and
    /// converted to `false`; an unknown name is `false` as well.
    pub async fn invoke(&self, name: &str, ctx: &RunContext, args: &[String]) -> bool {
        let plugin = match self.plugins.get(name) {
            Some(plugin) => plugin,
            None => {
                error!("Plugin '{}' not found", name);
                return false;
            }
        };

        info!("Running plugin '{}'", name);
        let success = match plugin.entry.run(ctx, args).await {
            Ok(success) => success,
            Err(e) => {
                error!("Plugin '{}' failed: {}", name, chain(e));
                false
            }
        };
        ctx.state()
            .record_meta(&format!("plugin:{}", name), json!({ "success": success }));
        success
    }
}
