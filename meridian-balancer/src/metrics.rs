//! Periodic state and reconcile reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use meridian_core::{Leadership, State};

use crate::reconcile::ReconcileStats;

/// Log counts every `interval` until `cancel` fires.
pub async fn monitor(
    state: Arc<State>,
    leadership: watch::Receiver<Leadership>,
    stats: Arc<ReconcileStats>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = state.copy();
        let passes = stats.snapshot();
        let standing = *leadership.borrow();
        info!(
            services = snapshot.service_count(),
            destinations = snapshot.destination_count(),
            leadership = %standing,
            passes = passes.passes,
            failures = passes.failures,
            last_failed_stage = passes.last_failed_stage.unwrap_or("-"),
            "balancer status"
        );
    }
}
