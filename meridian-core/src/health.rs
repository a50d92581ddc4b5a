//! Destination health and the health-filtered view of state.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::destination::DestinationId;
use crate::domain::snapshot::StateSnapshot;
use crate::signal::ChangeSender;
use crate::state::State;

/// Observed health of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The last probe succeeded.
    Healthy,
    /// The last probe failed.
    Unhealthy,
}

/// A lock-free table of destination health.
///
/// Uses `ArcSwap` so the reconcile pass can read the whole table without
/// contending with the prober, which replaces it wholesale after each round.
#[derive(Debug, Default)]
pub struct HealthTable {
    statuses: ArcSwap<HashMap<DestinationId, HealthStatus>>,
}

impl HealthTable {
    /// Create an empty table. Unknown destinations count as healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entire table.
    pub fn replace(&self, statuses: HashMap<DestinationId, HealthStatus>) {
        self.statuses.store(Arc::new(statuses));
    }

    /// Current status of a destination, if it has been probed.
    pub fn status(&self, id: &DestinationId) -> Option<HealthStatus> {
        self.statuses.load().get(id).copied()
    }

    /// Retrieve a snapshot of the whole table.
    pub fn snapshot(&self) -> Arc<HashMap<DestinationId, HealthStatus>> {
        self.statuses.load_full()
    }

    /// `snapshot` minus every destination currently marked unhealthy.
    ///
    /// Services are never removed.
    pub fn filter(&self, snapshot: &StateSnapshot) -> StateSnapshot {
        let statuses = self.statuses.load();
        let mut filtered = snapshot.clone();
        filtered.retain_destinations(|d| statuses.get(&d.id()) != Some(&HealthStatus::Unhealthy));
        filtered
    }
}

/// A health checker feeding the reconcile loop.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    /// Pure transform: `snapshot` without its unhealthy destinations.
    fn filter_healthy(&self, snapshot: &StateSnapshot) -> StateSnapshot;

    /// Probe destinations until `cancel` fires, pushing one change onto
    /// `changes` whenever a destination's health flips.
    async fn monitor(&self, state: Arc<State>, changes: ChangeSender, cancel: CancellationToken);
}
