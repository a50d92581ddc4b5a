//! Active TCP health checking of destinations.

pub mod prober;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meridian_core::{ChangeSender, HealthMonitor, HealthTable, State, StateSnapshot};

use crate::config::HealthConfig;

/// Probes every destination on a fixed interval and signals the reconcile
/// loop when any of them changes health.
#[derive(Debug)]
pub struct TcpHealthMonitor {
    table: HealthTable,
    interval: Duration,
    timeout: Duration,
}

impl TcpHealthMonitor {
    /// Create a monitor with an empty table.
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            table: HealthTable::new(),
            interval: config.interval,
            timeout: config.timeout,
        }
    }

    /// The table the monitor writes.
    pub fn table(&self) -> &HealthTable {
        &self.table
    }
}

#[async_trait]
impl HealthMonitor for TcpHealthMonitor {
    fn filter_healthy(&self, snapshot: &StateSnapshot) -> StateSnapshot {
        self.table.filter(snapshot)
    }

    async fn monitor(&self, state: Arc<State>, changes: ChangeSender, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let statuses = prober::probe_round(&state.copy(), self.timeout).await;
            let flipped = prober::flips(&self.table.snapshot(), &statuses);
            self.table.replace(statuses);

            if flipped.is_empty() {
                continue;
            }
            for (id, status) in &flipped {
                info!(destination = %id, ?status, "destination health changed");
            }
            if !changes.notify_or_cancel(&cancel).await {
                break;
            }
        }
        debug!("health monitor stopped");
    }
}
