//! Backend destination models.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::domain::service::ServiceId;

/// A unique identifier for a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub String);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How packets reach a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Masquerading: the balancer rewrites the destination address.
    Nat,
    /// Direct routing: the frame is re-addressed at layer 2.
    #[default]
    Route,
    /// IP-in-IP tunnelling.
    Tunnel,
}

/// A real backend server bound to exactly one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Human readable name, and the source of the destination identifier.
    pub name: String,
    /// The owning service.
    pub service_id: ServiceId,
    /// The backend address.
    pub address: IpAddr,
    /// The backend port.
    pub port: u16,
    /// Relative weight for weighted schedulers.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Forwarding mode for this destination.
    #[serde(default)]
    pub mode: ForwardingMode,
}

fn default_weight() -> u32 {
    1
}

impl Destination {
    /// Create a weight-1, direct-routed destination for `service_id`.
    pub fn new(
        name: impl Into<String>,
        service_id: ServiceId,
        address: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            service_id,
            address,
            port,
            weight: default_weight(),
            mode: ForwardingMode::default(),
        }
    }

    /// The stable identifier of this destination.
    pub fn id(&self) -> DestinationId {
        DestinationId(self.name.clone())
    }

    /// The socket address of the backend.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
