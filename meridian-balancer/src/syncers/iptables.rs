//! Firewall rules for NAT-mode return traffic, driven with `iptables`.
//!
//! Destinations in NAT mode see the balancer as their peer, so traffic
//! leaving toward them through the outbound interface is source-translated
//! to the configured SNAT address.
//! Every rule carries a `meridian:<service>` comment; only rules with that
//! tag are ever touched.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meridian_core::{ForwardingMode, Protocol, StateSnapshot, SyncError, Syncer};

use super::command::{args, CommandRunner};

const COMMENT_PREFIX: &str = "meridian:";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SnatRule {
    service: String,
    protocol: Protocol,
    vip: IpAddr,
    port: u16,
    out_iface: String,
    to_source: IpAddr,
}

impl SnatRule {
    fn program(&self) -> &'static str {
        if self.vip.is_ipv4() {
            "iptables"
        } else {
            "ip6tables"
        }
    }

    fn argv(&self, action: &str) -> Vec<String> {
        let prefix = if self.vip.is_ipv4() { 32 } else { 128 };
        args([
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
            "POSTROUTING".to_string(),
            "-o".to_string(),
            self.out_iface.clone(),
            "-p".to_string(),
            self.protocol.to_string(),
            "-m".to_string(),
            "ipvs".to_string(),
            "--vaddr".to_string(),
            format!("{}/{prefix}", self.vip),
            "--vport".to_string(),
            self.port.to_string(),
            "-j".to_string(),
            "SNAT".to_string(),
            "--to-source".to_string(),
            self.to_source.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("{COMMENT_PREFIX}{}", self.service),
        ])
    }
}

fn desired_rules(
    state: &StateSnapshot,
    snat: Option<IpAddr>,
    out_iface: &str,
) -> BTreeSet<SnatRule> {
    let Some(to_source) = snat else {
        return BTreeSet::new();
    };
    state
        .pools()
        .filter(|(_, dsts)| dsts.iter().any(|d| d.mode == ForwardingMode::Nat))
        .filter(|(svc, _)| svc.address.is_ipv4() == to_source.is_ipv4())
        .map(|(svc, _)| SnatRule {
            service: svc.name.clone(),
            protocol: svc.protocol,
            vip: svc.address,
            port: svc.port,
            out_iface: out_iface.to_string(),
            to_source,
        })
        .collect()
}

/// Parse the rule spec of one tagged `-S` line.
///
/// `iptables -S` prints matches before the target, so tokens are read by
/// flag rather than by position.
fn parse_rule(spec: &str) -> Option<SnatRule> {
    let mut tokens = spec.split_whitespace();
    let mut protocol = None;
    let mut vip = None;
    let mut port = None;
    let mut out_iface = None;
    let mut to_source = None;
    let mut service = None;

    while let Some(flag) = tokens.next() {
        match flag {
            "-p" => {
                protocol = match tokens.next()? {
                    "tcp" => Some(Protocol::Tcp),
                    "udp" => Some(Protocol::Udp),
                    _ => None,
                }
            }
            "--vaddr" => vip = tokens.next()?.split('/').next()?.parse().ok(),
            "--vport" => port = tokens.next()?.parse().ok(),
            "-o" => out_iface = Some(tokens.next()?.to_string()),
            "--to-source" => to_source = tokens.next()?.parse().ok(),
            "--comment" => {
                service = tokens
                    .next()?
                    .trim_matches('"')
                    .strip_prefix(COMMENT_PREFIX)
                    .map(str::to_string)
            }
            _ => {}
        }
    }
    Some(SnatRule {
        service: service?,
        protocol: protocol?,
        vip: vip?,
        port: port?,
        out_iface: out_iface?,
        to_source: to_source?,
    })
}

/// A tagged rule found in the live chain.
struct LiveRule {
    program: &'static str,
    spec: String,
    parsed: Option<SnatRule>,
}

/// Keeps the tagged SNAT rules equal to the NAT-mode services in state.
///
/// The chain is listed at the start of every pass; rules carrying our tag
/// that are not wanted, unreadable or duplicated are deleted.
pub struct IptablesSyncer {
    runner: Arc<dyn CommandRunner>,
    snat_address: Option<IpAddr>,
    out_iface: String,
    serial: Mutex<()>,
}

impl IptablesSyncer {
    /// Manage SNAT for traffic leaving through `out_iface`, removing rules
    /// left behind by a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be listed or a stale rule
    /// cannot be deleted.
    pub async fn new(
        runner: Arc<dyn CommandRunner>,
        snat_address: Option<IpAddr>,
        out_iface: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let syncer = Self {
            runner,
            snat_address,
            out_iface: out_iface.into(),
            serial: Mutex::new(()),
        };
        syncer.sync(&StateSnapshot::default()).await?;
        Ok(syncer)
    }

    fn programs(&self) -> &'static [&'static str] {
        match self.snat_address {
            Some(IpAddr::V6(_)) => &["iptables", "ip6tables"],
            _ => &["iptables"],
        }
    }

    async fn live_rules(&self) -> Result<Vec<LiveRule>, SyncError> {
        let mut live = Vec::new();
        for &program in self.programs() {
            let listing = self
                .runner
                .run(program, &args(["-t", "nat", "-S", "POSTROUTING"]))
                .await?;
            for line in listing.lines().filter(|l| l.contains(COMMENT_PREFIX)) {
                let Some(spec) = line.trim().strip_prefix("-A ") else {
                    continue;
                };
                live.push(LiveRule {
                    program,
                    spec: spec.to_string(),
                    parsed: parse_rule(spec),
                });
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl Syncer for IptablesSyncer {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        let desired = desired_rules(state, self.snat_address, &self.out_iface);
        let _serial = self.serial.lock().await;

        let mut present = BTreeSet::new();
        for rule in self.live_rules().await? {
            if let Some(parsed) = &rule.parsed {
                let wanted = desired.contains(parsed) && rule.program == parsed.program();
                if wanted && present.insert(parsed.clone()) {
                    continue;
                }
            }
            let mut argv = args(["-t", "nat", "-D"]);
            argv.extend(rule.spec.split_whitespace().map(str::to_string));
            self.runner.run(rule.program, &argv).await?;
            info!(program = rule.program, rule = %rule.spec, "removed rule");
        }

        for rule in desired.difference(&present) {
            self.runner.run(rule.program(), &rule.argv("-A")).await?;
        }

        let nat_wanted = state.destinations().any(|d| d.mode == ForwardingMode::Nat);
        if self.snat_address.is_none() && nat_wanted {
            warn!("nat destinations present but firewall.snat_address is unset");
        }
        debug!(rules = desired.len(), "firewall in sync");
        Ok(())
    }
}
