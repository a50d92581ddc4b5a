//! Virtual service models.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::domain::destination::ForwardingMode;

/// A unique identifier for a virtual service.
///
/// Derived from the service name, so every replica that sees the same
/// record computes the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// The lowercase protocol name, as host tools spell it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling algorithm used to spread connections across destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// Round robin.
    #[default]
    Rr,
    /// Weighted round robin.
    Wrr,
    /// Least connections.
    Lc,
    /// Weighted least connections.
    Wlc,
    /// Source hashing.
    Sh,
    /// Destination hashing.
    Dh,
}

impl Scheduler {
    /// The scheduler mnemonic understood by the forwarding backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rr => "rr",
            Self::Wrr => "wrr",
            Self::Lc => "lc",
            Self::Wlc => "wlc",
            Self::Sh => "sh",
            Self::Dh => "dh",
        }
    }
}

/// A virtual service exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Human readable name, and the source of the service identifier.
    pub name: String,
    /// The virtual address clients connect to.
    pub address: IpAddr,
    /// The virtual port clients connect to.
    pub port: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Scheduling algorithm.
    #[serde(default)]
    pub scheduler: Scheduler,
    /// Default forwarding mode for the service's destinations.
    #[serde(default)]
    pub mode: ForwardingMode,
    /// Arbitrary metadata attached by the API layer.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Service {
    /// Create a TCP round-robin service with no metadata.
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            protocol: Protocol::default(),
            scheduler: Scheduler::default(),
            mode: ForwardingMode::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// The stable identifier of this service.
    pub fn id(&self) -> ServiceId {
        ServiceId(self.name.clone())
    }
}
