//! # Configuration
//!
//! TOML configuration for the balancer daemon. Every section is optional
//! and falls back to its defaults.
//!
//! ```toml
//! name = "meridian-1"
//! cluster_mode = "unicast"
//! enable_health_checks = true
//!
//! [interfaces]
//! inbound = "eth0"
//! outbound = "eth1"
//!
//! [election]
//! key = "meridian/leader"
//! lease = "20s"
//!
//! [ipam]
//! ranges = ["192.168.100.0/24"]
//! ```

mod loader;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub use loader::ConfigLoader;

/// How the cluster publishes its virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// One elected leader owns every VIP and answers ARP for it.
    #[default]
    Unicast,
    /// Every node carries every VIP and advertises a route to it.
    Anycast,
}

/// Root configuration for one balancer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Instance name, used as the election candidate name.
    pub name: String,

    /// Cluster publishing mode.
    pub cluster_mode: ClusterMode,

    /// Filter unhealthy destinations out before reconciling.
    pub enable_health_checks: bool,

    /// Log host commands instead of running them.
    pub dry_run: bool,

    /// Network interfaces.
    pub interfaces: InterfacesConfig,

    /// Store connection.
    pub store: StoreConfig,

    /// Leader election.
    pub election: ElectionConfig,

    /// Reconcile loop.
    pub reconcile: ReconcileConfig,

    /// Health checking.
    pub health: HealthConfig,

    /// Metrics monitor.
    pub metrics: MetricsConfig,

    /// Virtual address allocation.
    pub ipam: IpamConfig,

    /// Firewall rules.
    pub firewall: FirewallConfig,

    /// Anycast route advertisement.
    pub bgp: BgpConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            name: "meridian".to_string(),
            cluster_mode: ClusterMode::default(),
            enable_health_checks: false,
            dry_run: false,
            interfaces: InterfacesConfig::default(),
            store: StoreConfig::default(),
            election: ElectionConfig::default(),
            reconcile: ReconcileConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            ipam: IpamConfig::default(),
            firewall: FirewallConfig::default(),
            bgp: BgpConfig::default(),
        }
    }
}

impl BalancerConfig {
    /// Whether the cluster runs in anycast mode.
    pub fn is_anycast(&self) -> bool {
        self.cluster_mode == ClusterMode::Anycast
    }

    /// Check field values that TOML parsing cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first invalid field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.interfaces.inbound.trim().is_empty() {
            return Err(invalid("interfaces.inbound", "must not be empty"));
        }
        if self.interfaces.outbound.trim().is_empty() {
            return Err(invalid("interfaces.outbound", "must not be empty"));
        }
        if self.election.key.trim().is_empty() {
            return Err(invalid("election.key", "must not be empty"));
        }

        let durations = [
            ("election.lease", self.election.lease),
            ("reconcile.sync_timeout", self.reconcile.sync_timeout),
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("metrics.interval", self.metrics.interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.to_string(),
    }
}

/// Network interfaces the balancer works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfacesConfig {
    /// Interface that carries the VIPs and receives client traffic.
    pub inbound: String,
    /// Interface facing the destinations. SNAT rules only match traffic
    /// leaving through it.
    pub outbound: String,
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            inbound: "eth0".to_string(),
            outbound: "eth1".to_string(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// TOML file with the services and destinations to start from.
    pub seed: Option<PathBuf>,
}

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Election key shared by every instance of the cluster.
    pub key: String,

    /// Lease held by the leader.
    #[serde(with = "humantime_serde")]
    pub lease: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            key: "meridian/leader".to_string(),
            lease: Duration::from_secs(20),
        }
    }
}

/// Reconcile loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Deadline for each syncer call.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between probe rounds.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Connect timeout for each probe.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(1500),
        }
    }
}

/// Metrics monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Time between reports.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Virtual address allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    /// Ranges VIPs are drawn from.
    pub ranges: Vec<IpNet>,
}

/// Firewall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Source address for NAT-mode return traffic. No SNAT rules are
    /// installed when unset.
    pub snat_address: Option<IpAddr>,
}

/// Anycast route advertisement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BgpConfig {
    /// `gobgp` client binary.
    pub client: String,

    /// `gobgpd` binary.
    pub daemon: String,

    /// Daemon configuration file. The daemon is supervised only when set.
    pub daemon_config: Option<PathBuf>,
}

impl Default for BgpConfig {
    fn default() -> Self {
        Self {
            client: "gobgp".to_string(),
            daemon: "gobgpd".to_string(),
            daemon_config: None,
        }
    }
}
