//! Process-wide application state.
//!
//! The store owns the interface and device maps, the loaded-plugin list, the
//! user configuration and the append-only event log. All access goes through
//! methods which confine the mutex to the call; holders never invoke external
//! processes while the lock is taken.

use crate::{
    schema::{Device, Interface, ZERO_MAC},
    state::{
        event::{Event, EventKind},
        unix_now,
    },
};
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Debug, Default)]
/// Central application state. Constructed once at startup and shared via
/// `Arc`; never a module-level static.
pub struct AppState {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    interfaces: HashMap<String, Interface>,
    devices: HashMap<String, Device>,
    loaded_plugins: Vec<String>,
    user_config: HashMap<String, Value>,
    events: Vec<Event>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
/// On-disk snapshot shape. Missing top-level keys deserialize to empty maps.
struct Snapshot {
    loaded_plugins: Vec<String>,
    discovery_graph: DiscoveryGraph,
    user_config: HashMap<String, Value>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct DiscoveryGraph {
    interfaces: HashMap<String, Interface>,
    devices: HashMap<String, Device>,
}

impl AppState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append_event(inner: &mut Inner, kind: EventKind, id: &str, data: Value) {
        let floor = inner.events.last().map(Event::timestamp).unwrap_or(0.0);
        let mut event = Event::new(unix_now(), kind, id, data);
        event.clamp_after(floor);
        inner.events.push(event);
    }

    /// A copy of the interface map.
    pub fn get_interfaces(&self) -> HashMap<String, Interface> {
        self.lock().interfaces.clone()
    }

    /// Look up a single interface by name.
    pub fn interface(&self, name: &str) -> Option<Interface> {
        self.lock().interfaces.get(name).cloned()
    }

    /// Merge the patch into the interface map. Existing keys absent from the
    /// patch survive. Each merged entry is recorded in the event log.
    pub fn update_interfaces(&self, patch: HashMap<String, Interface>) {
        let mut inner = self.lock();
        for (name, iface) in patch {
            let data = serde_json::to_value(&iface).unwrap_or(Value::Null);
            Self::append_event(&mut inner, EventKind::Interface, &name, data);
            inner.interfaces.insert(name, iface);
        }
    }

    /// Interfaces filtered by the usual workflow predicates.
    pub fn interfaces_filtered(
        &self,
        wireless_only: bool,
        monitor_capable_only: bool,
        up_only: bool,
    ) -> Vec<Interface> {
        let mut result: Vec<Interface> = self
            .lock()
            .interfaces
            .values()
            .filter(|i| !wireless_only || i.is_wireless())
            .filter(|i| !monitor_capable_only || i.capabilities().monitor())
            .filter(|i| !up_only || i.is_up())
            .cloned()
            .collect();
        // Stable order for deterministic auto-selection.
        result.sort_by(|a, b| a.name().cmp(b.name()));
        result
    }

    /// A copy of the device map.
    pub fn get_devices(&self) -> HashMap<String, Device> {
        self.lock().devices.clone()
    }

    /// Merge the patch into the device map, dropping all-zero MAC keys.
    pub fn update_devices(&self, patch: HashMap<String, Device>) {
        let mut inner = self.lock();
        for (mac, device) in patch {
            if mac == ZERO_MAC {
                debug!("Dropping device entry with all-zero MAC");
                continue;
            }
            let data = serde_json::to_value(&device).unwrap_or(Value::Null);
            Self::append_event(&mut inner, EventKind::Device, &mac, data);
            inner.devices.insert(mac, device);
        }
    }

    /// Record a captured credential in the event log.
    pub fn record_credential(&self, username: &str, data: Value) {
        let mut inner = self.lock();
        Self::append_event(&mut inner, EventKind::Credential, username, data);
    }

    /// Record a freeform run-level event.
    pub fn record_meta(&self, id: &str, data: Value) {
        let mut inner = self.lock();
        Self::append_event(&mut inner, EventKind::Meta, id, data);
    }

    /// Names of the plugins discovered at startup.
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.lock().loaded_plugins.clone()
    }

    pub fn set_loaded_plugins(&self, plugins: Vec<String>) {
        self.lock().loaded_plugins = plugins;
    }

    /// A copy of the user configuration map.
    pub fn get_config(&self) -> HashMap<String, Value> {
        self.lock().user_config.clone()
    }

    pub fn set_config(&self, config: HashMap<String, Value>) {
        self.lock().user_config = config;
    }

    /// A copy of the event log.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Persist the serialisable subset as a single JSON object.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let inner = self.lock();
            Snapshot {
                loaded_plugins: inner.loaded_plugins.clone(),
                discovery_graph: DiscoveryGraph {
                    interfaces: inner.interfaces.clone(),
                    devices: inner.devices.clone(),
                },
                user_config: inner.user_config.clone(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot).context("serialize state snapshot")?;
        fs::write(path, json).with_context(|| format!("write snapshot to {}", path.display()))?;
        debug!("State snapshot written to {}", path.display());
        Ok(())
    }

    /// Load a snapshot, tolerating missing top-level keys. A missing or
    /// malformed file leaves the state untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("State file not found: {}, starting empty", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read snapshot {}", path.display()))
            }
        };
        let snapshot: Snapshot =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

        let mut inner = self.lock();
        inner.loaded_plugins = snapshot.loaded_plugins;
        inner.interfaces = snapshot.discovery_graph.interfaces;
        inner.devices = snapshot.discovery_graph.devices;
        inner.user_config = snapshot.user_config;
        Ok(())
    }

    /// Export the event log as line-delimited JSON, one entry per line.
    pub fn export_event_log(&self, path: &Path) -> Result<usize> {
        let events = self.events();
        let mut file = fs::File::create(path)
            .with_context(|| format!("create event log {}", path.display()))?;
        for event in &events {
            let line = serde_json::to_string(event).context("serialize event")?;
            writeln!(file, "{}", line).context("write event line")?;
        }
        debug!(
            "Exported {} events to {}",
            events.len(),
            path.display()
        );
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::interface::{CapabilitiesBuilder, InterfaceBuilder, Mode};
    use crate::schema::device::DeviceBuilder;
    use tempfile::TempDir;

    fn wlan(name: &str, monitor: bool) -> Result<Interface> {
        Ok(InterfaceBuilder::default()
            .name(name)
            .mac("AA:BB:CC:DD:EE:FF")
            .is_up(true)
            .is_wireless(true)
            .mode(Mode::Managed)
            .capabilities(
                CapabilitiesBuilder::default()
                    .managed(true)
                    .monitor(monitor)
                    .build()?,
            )
            .build()?)
    }

    #[test]
    fn update_interfaces_merges() -> Result<()> {
        let state = AppState::default();
        state.update_interfaces(HashMap::from([("wlan0".to_string(), wlan("wlan0", true)?)]));
        state.update_interfaces(HashMap::from([("wlan1".to_string(), wlan("wlan1", false)?)]));

        let interfaces = state.get_interfaces();
        assert_eq!(interfaces.len(), 2);
        assert!(interfaces.contains_key("wlan0"));
        assert!(interfaces.contains_key("wlan1"));
        Ok(())
    }

    #[test]
    fn filtered_queries() -> Result<()> {
        let state = AppState::default();
        state.update_interfaces(HashMap::from([
            ("wlan0".to_string(), wlan("wlan0", true)?),
            ("wlan1".to_string(), wlan("wlan1", false)?),
        ]));

        let monitor_capable = state.interfaces_filtered(true, true, true);
        assert_eq!(monitor_capable.len(), 1);
        assert_eq!(monitor_capable[0].name(), "wlan0");
        Ok(())
    }

    #[test]
    fn zero_mac_devices_are_dropped() -> Result<()> {
        let state = AppState::default();
        state.update_devices(HashMap::from([
            (
                ZERO_MAC.to_string(),
                DeviceBuilder::default().mac(ZERO_MAC).build()?,
            ),
            (
                "AA:BB:CC:DD:EE:FF".to_string(),
                DeviceBuilder::default().mac("AA:BB:CC:DD:EE:FF").build()?,
            ),
        ]));

        let devices = state.get_devices();
        assert_eq!(devices.len(), 1);
        assert!(!devices.contains_key(ZERO_MAC));
        Ok(())
    }

    #[test]
    fn event_log_is_monotonic() -> Result<()> {
        let state = AppState::default();
        for i in 0..16 {
            state.record_meta(&format!("step-{}", i), Value::Null);
        }

        let events = state.events();
        assert_eq!(events.len(), 16);
        for pair in events.windows(2) {
            assert!(pair[0].timestamp() <= pair[1].timestamp());
        }
        Ok(())
    }

    #[test]
    fn save_load_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");

        let state = AppState::default();
        state.update_interfaces(HashMap::from([("wlan0".to_string(), wlan("wlan0", true)?)]));
        state.update_devices(HashMap::from([(
            "AA:BB:CC:DD:EE:FF".to_string(),
            DeviceBuilder::default().mac("AA:BB:CC:DD:EE:FF").build()?,
        )]));
        state.set_loaded_plugins(vec!["evil_twin".to_string()]);
        state.set_config(HashMap::from([(
            "gateway".to_string(),
            Value::String("10.0.0.1/24".to_string()),
        )]));
        state.save(&path)?;

        let restored = AppState::default();
        restored.load(&path)?;
        assert_eq!(restored.get_interfaces().len(), 1);
        assert_eq!(restored.get_devices().len(), 1);
        assert_eq!(restored.loaded_plugins(), vec!["evil_twin".to_string()]);
        assert_eq!(
            restored.get_config().get("gateway"),
            Some(&Value::String("10.0.0.1/24".to_string()))
        );
        Ok(())
    }

    #[test]
    fn load_tolerates_missing_keys() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"loaded_plugins": ["jammer"]}"#)?;

        let state = AppState::default();
        state.load(&path)?;
        assert_eq!(state.loaded_plugins(), vec!["jammer".to_string()]);
        assert!(state.get_interfaces().is_empty());
        assert!(state.get_devices().is_empty());
        Ok(())
    }

    #[test]
    fn load_missing_file_is_not_an_error() -> Result<()> {
        let state = AppState::default();
        state.load(Path::new("/nonexistent/state.json"))?;
        Ok(())
    }

    #[test]
    fn export_event_log_jsonl() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("events.jsonl");

        let state = AppState::default();
        state.record_credential(
            "alice",
            serde_json::json!({"username": "alice", "password": "hunter2"}),
        );
        state.record_meta("run", Value::Null);
        let count = state.export_event_log(&path)?;
        assert_eq!(count, 2);

        let contents = fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["type"], Value::String("credential".to_string()));
        assert_eq!(first["id"], Value::String("alice".to_string()));
        Ok(())
    }
}
