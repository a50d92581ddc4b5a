//! One round of active TCP health checks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, warn};

use meridian_core::{DestinationId, HealthStatus, StateSnapshot};

/// Connect to `addr` once; healthy if the handshake completes in time.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> HealthStatus {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => HealthStatus::Healthy,
        // Timeout or connection refused
        _ => HealthStatus::Unhealthy,
    }
}

/// Probe every destination bound to a known service, concurrently.
pub async fn probe_round(
    snapshot: &StateSnapshot,
    timeout: Duration,
) -> HashMap<DestinationId, HealthStatus> {
    let mut probes = JoinSet::new();
    for (_, destinations) in snapshot.pools() {
        for dst in destinations {
            let id = dst.id();
            let addr = dst.socket_addr();
            probes.spawn(async move { (id, probe(addr, timeout).await) });
        }
    }

    let mut statuses = HashMap::with_capacity(probes.len());
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((id, status)) => {
                statuses.insert(id, status);
            }
            Err(e) => warn!(error = %e, "health probe task failed"),
        }
    }
    debug!(probed = statuses.len(), "health round finished");
    statuses
}

/// Destinations whose status differs from `previous`. An unprobed
/// destination counts as healthy.
pub fn flips(
    previous: &HashMap<DestinationId, HealthStatus>,
    current: &HashMap<DestinationId, HealthStatus>,
) -> Vec<(DestinationId, HealthStatus)> {
    current
        .iter()
        .filter(|(id, status)| {
            let before = previous.get(*id).copied().unwrap_or(HealthStatus::Healthy);
            before != **status
        })
        .map(|(id, status)| (id.clone(), *status))
        .collect()
}
