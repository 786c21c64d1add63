//! DHCP and DNS service lifecycle through dnsmasq.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    supervise::Helper,
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::Getters;
use log::{debug, info, warn};
use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};
use tokio::time;

/// How long dnsmasq gets to prove it came up.
const STARTUP_PROBE: Duration = Duration::from_secs(3);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
#[getset(get = "pub")]
/// DHCP pool and gateway settings for one rogue AP.
pub struct DhcpSettings {
    #[builder(default = "\"10.0.0.10\".to_string()")]
    range_start: String,

    #[builder(default = "\"10.0.0.250\".to_string()")]
    range_end: String,

    #[builder(default = "\"12h\".to_string()")]
    lease_time: String,

    #[builder(default = "\"10.0.0.1\".to_string()")]
    /// Router and DNS option handed to clients; the rogue gateway.
    gateway_ip: String,

    /// Optional upstream resolver (`server=` line).
    upstream_dns: Option<String>,

    /// Hostname → address spoof entries written to an `addn-hosts` file.
    dns_entries: BTreeMap<String, String>,
}

/// Render dnsmasq.conf for the given interface and settings.
pub fn generate_dnsmasq_config(
    interface: &str,
    settings: &DhcpSettings,
    hosts_path: Option<&PathBuf>,
) -> String {
    let mut lines = vec![
        format!("interface={}", interface),
        format!(
            "dhcp-range={},{},{}",
            settings.range_start, settings.range_end, settings.lease_time
        ),
        format!("dhcp-option=3,{}", settings.gateway_ip),
        format!("dhcp-option=6,{}", settings.gateway_ip),
        "log-queries".to_string(),
        "log-dhcp".to_string(),
        "no-resolv".to_string(),
    ];
    if let Some(upstream) = &settings.upstream_dns {
        lines.push(format!("server={}", upstream));
    }
    if let Some(hosts) = hosts_path {
        lines.push(format!("addn-hosts={}", hosts.display()));
    }
    lines.join("\n")
}

/// Render the `addn-hosts` companion file, one `ip host` per line.
pub fn generate_hosts_file(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(host, ip)| format!("{} {}", ip, host))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Builder, Debug)]
#[builder(pattern = "owned", setter(into))]
/// Manages one dnsmasq instance and its generated configuration files.
pub struct DhcpDnsManager {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,

    #[builder(default = "\"dnsmasq\".into()")]
    /// Path to the dnsmasq binary.
    dnsmasq_binary: PathBuf,

    #[builder(default = "std::env::temp_dir()")]
    /// Directory for the generated configuration files.
    config_dir: PathBuf,

    #[builder(setter(skip))]
    helper: Option<Helper>,

    #[builder(setter(skip))]
    config_path: Option<PathBuf>,

    #[builder(setter(skip))]
    hosts_path: Option<PathBuf>,
}

impl Default for DhcpDnsManager {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
            dnsmasq_binary: "dnsmasq".into(),
            config_dir: std::env::temp_dir(),
            helper: None,
            config_path: None,
            hosts_path: None,
        }
    }
}

impl DhcpDnsManager {
    /// Start dnsmasq bound to `interface`. Any orphaned dnsmasq from an
    /// earlier crashed run is reclaimed first.
    pub async fn start(&mut self, interface: &str, settings: &DhcpSettings) -> Result<()> {
        info!(
            "Starting DHCP/DNS on {} with range {}-{}",
            interface, settings.range_start, settings.range_end
        );

        // Reclaim orphans; a stale dnsmasq would hold the DHCP port.
        self.exec
            .run_unchecked(&argv(["killall", "-q", "dnsmasq"]), &ExecOpts::root_unchecked())
            .await;
        time::sleep(Duration::from_secs(1)).await;

        let hosts_path = if settings.dns_entries.is_empty() {
            None
        } else {
            let path = self.config_dir.join(format!("dnsmasq_{}.hosts", interface));
            fs::write(&path, generate_hosts_file(&settings.dns_entries))
                .with_context(|| format!("write hosts file {}", path.display()))?;
            Some(path)
        };
        let config_path = self.config_dir.join(format!("dnsmasq_{}.conf", interface));
        fs::write(
            &config_path,
            generate_dnsmasq_config(interface, settings, hosts_path.as_ref()),
        )
        .with_context(|| format!("write dnsmasq config {}", config_path.display()))?;
        debug!("Generated dnsmasq config {}", config_path.display());
        self.config_path = Some(config_path.clone());
        self.hosts_path = hosts_path.clone();

        // -k keeps dnsmasq in the foreground so it stays our supervised child.
        let mut cmd = vec![
            self.dnsmasq_binary.to_string_lossy().to_string(),
            "-k".to_string(),
            "-C".to_string(),
            config_path.to_string_lossy().to_string(),
        ];
        if let Some(hosts) = &hosts_path {
            cmd.push("-H".to_string());
            cmd.push(hosts.to_string_lossy().to_string());
        }

        let mut helper = Helper::spawn("dnsmasq", &cmd).context("spawn dnsmasq")?;
        time::sleep(STARTUP_PROBE).await;
        if !helper.is_running() {
            let stderr = helper.stderr_tail();
            self.remove_config_files();
            return Err(Error::InfraStartupFailed(format!(
                "dnsmasq terminated during startup: {}",
                stderr
            ))
            .into());
        }
        self.helper = Some(helper);
        info!("DHCP/DNS started on {}", interface);
        Ok(())
    }

    /// Whether the dnsmasq child is still alive.
    pub fn is_running(&mut self) -> bool {
        self.helper.as_mut().map(Helper::is_running).unwrap_or(false)
    }

    /// Stop dnsmasq and delete the generated files.
    pub async fn stop(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            helper.stop(STOP_GRACE).await;
            info!("dnsmasq stopped");
        } else {
            debug!("No dnsmasq process to stop");
        }
        self.remove_config_files();
    }

    fn remove_config_files(&mut self) {
        for path in [self.config_path.take(), self.hosts_path.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl Drop for DhcpDnsManager {
    fn drop(&mut self) {
        // Belt and braces: the helper kills its group in its own drop.
        self.remove_config_files();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::ExecMock;
    use tempfile::TempDir;

    fn settings() -> Result<DhcpSettings> {
        Ok(DhcpSettingsBuilder::default()
            .dns_entries(BTreeMap::from([
                ("www.google.com".to_string(), "10.0.0.1".to_string()),
                ("captive.apple.com".to_string(), "10.0.0.1".to_string()),
            ]))
            .build()?)
    }

    #[test]
    fn config_rendering() -> Result<()> {
        let settings = settings()?;
        let hosts = PathBuf::from("/tmp/dnsmasq_wlan0.hosts");
        let config = generate_dnsmasq_config("wlan0", &settings, Some(&hosts));

        assert!(config.contains("interface=wlan0"));
        assert!(config.contains("dhcp-range=10.0.0.10,10.0.0.250,12h"));
        assert!(config.contains("dhcp-option=3,10.0.0.1"));
        assert!(config.contains("dhcp-option=6,10.0.0.1"));
        assert!(config.contains("log-queries"));
        assert!(config.contains("log-dhcp"));
        assert!(config.contains("no-resolv"));
        assert!(config.contains("addn-hosts=/tmp/dnsmasq_wlan0.hosts"));
        assert!(!config.contains("server="));
        Ok(())
    }

    #[test]
    fn config_with_upstream_dns() -> Result<()> {
        let settings = DhcpSettingsBuilder::default()
            .upstream_dns(Some("8.8.8.8".to_string()))
            .build()?;
        let config = generate_dnsmasq_config("wlan0", &settings, None);
        assert!(config.contains("server=8.8.8.8"));
        assert!(!config.contains("addn-hosts"));
        Ok(())
    }

    #[test]
    fn hosts_file_rendering() -> Result<()> {
        let settings = settings()?;
        let hosts = generate_hosts_file(settings.dns_entries());
        assert_eq!(
            hosts,
            "10.0.0.1 captive.apple.com\n10.0.0.1 www.google.com"
        );
        Ok(())
    }

    #[tokio::test]
    async fn start_and_stop_with_long_lived_binary() -> Result<()> {
        let dir = TempDir::new()?;
        let mock = ExecMock::default();
        let mut manager = DhcpDnsManagerBuilder::default()
            .exec(Box::new(mock.clone()) as Box<dyn Exec>)
            .dnsmasq_binary(which::which("yes")?)
            .config_dir(dir.path())
            .build()?;

        manager.start("wlan0", &settings()?).await?;
        assert_eq!(mock.joined_calls(), vec!["killall -q dnsmasq".to_string()]);
        assert!(manager.is_running());
        assert!(dir.path().join("dnsmasq_wlan0.conf").exists());
        assert!(dir.path().join("dnsmasq_wlan0.hosts").exists());

        manager.stop().await;
        assert!(!manager.is_running());
        assert!(!dir.path().join("dnsmasq_wlan0.conf").exists());
        assert!(!dir.path().join("dnsmasq_wlan0.hosts").exists());
        Ok(())
    }

    #[tokio::test]
    async fn start_fails_when_binary_dies() -> Result<()> {
        let dir = TempDir::new()?;
        let mut manager = DhcpDnsManagerBuilder::default()
            .exec(Box::new(ExecMock::default()) as Box<dyn Exec>)
            .dnsmasq_binary(which::which("false")?)
            .config_dir(dir.path())
            .build()?;

        let res = manager.start("wlan0", &DhcpSettings::default()).await;
        let err = res.expect_err("dnsmasq died");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InfraStartupFailed(_))
        ));
        assert!(!dir.path().join("dnsmasq_wlan0.conf").exists());
        Ok(())
    }
}
