//! Per-invocation run context.
//!
//! A workflow receives a single [`RunContext`]: scratch metadata for the run
//! layered over a shared reference to the [`AppState`]. Contexts never
//! outlive their workflow and are never shared between workflows.

use crate::state::store::AppState;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Well-known run context keys.
pub mod keys {
    pub const AUTO_SELECT: &str = "auto_select";
    pub const MOCK_MODE: &str = "mock_mode";
    pub const AP_IFACE: &str = "ap_iface";
    pub const DEAUTH_IFACE: &str = "deauth_iface";
    pub const VERIFY_IFACE: &str = "verify_iface";
    pub const INTERNET_IFACE: &str = "internet_iface";
    pub const TARGET_BSSID: &str = "target_bssid";
    pub const TARGET_SSID: &str = "target_ssid";
    pub const TARGET_CHANNEL: &str = "target_channel";
    pub const SCAN_DURATION: &str = "scan_duration";
    pub const CAPTURE_DURATION: &str = "capture_duration";
    pub const DEAUTH_COUNT: &str = "deauth_count";
    pub const SECURITY_FILTER: &str = "security_filter";
    pub const VERIFY_TIMEOUT: &str = "verify_timeout";
    pub const LURE_TIMEOUT: &str = "lure_timeout";
    pub const WORDLIST: &str = "wordlist";
    pub const DEAUTH_NM_UNMANAGED: &str = "deauth_iface_nm_unmanaged";
    pub const AP_NM_MANAGED: &str = "ap_iface_nm_managed";
    pub const CAPTURED_USERNAME: &str = "captured_username";
    pub const CRACKED_PASSWORD: &str = "cracked_password";
    pub const HANDSHAKE_FILE: &str = "handshake_file";
    pub const CREDENTIALS_VERIFIED: &str = "credentials_verified";
}

#[derive(Clone, Debug)]
/// Mutex-guarded key/value scratchpad plus the shared state store.
pub struct RunContext {
    state: Arc<AppState>,
    meta: Arc<Mutex<HashMap<String, Value>>>,
}

impl RunContext {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            meta: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The shared application state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        match self.meta.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set<V: Into<Value>>(&self, key: &str, value: V) {
        self.lock().insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(ToString::to_string))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    /// Export the scratch metadata for summaries and tests.
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn set_and_get() -> Result<()> {
        let ctx = RunContext::new(Arc::new(AppState::default()));

        ctx.set(keys::AUTO_SELECT, true);
        ctx.set(keys::TARGET_SSID, "example");
        ctx.set(keys::TARGET_CHANNEL, 6u64);

        assert!(ctx.get_bool(keys::AUTO_SELECT));
        assert_eq!(ctx.get_str(keys::TARGET_SSID).as_deref(), Some("example"));
        assert_eq!(ctx.get_u64(keys::TARGET_CHANNEL), Some(6));
        assert!(ctx.get(keys::TARGET_BSSID).is_none());
        Ok(())
    }

    #[test]
    fn missing_bool_defaults_false() {
        let ctx = RunContext::new(Arc::new(AppState::default()));
        assert!(!ctx.get_bool(keys::MOCK_MODE));
    }

    #[test]
    fn context_shares_the_store() {
        let state = Arc::new(AppState::default());
        let ctx = RunContext::new(Arc::clone(&state));

        ctx.state().set_loaded_plugins(vec!["jammer".to_string()]);
        assert_eq!(state.loaded_plugins(), vec!["jammer".to_string()]);
    }
}
