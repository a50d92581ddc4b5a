//! The staged reconcile pass and the loop that drives it.
//!
//! A pass walks an ordered list of [`Stage`]s. Stages run one at a time,
//! each bounded by the sync timeout; the first failure ends the pass and
//! is reported with the stage's name. A [`Gate::LeaderOnly`] stage that is
//! not satisfied ends the pass early without error.
//!
//! Leadership is read when a gated stage is reached, not when the pass
//! starts. The read and the gated sync happen under the pipeline's
//! leadership lock, which the election watcher also holds while it applies
//! a transition, so a demotion can never land between the two.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use meridian_core::{
    ChangeReceiver, HealthMonitor, Leadership, RoutingSyncer, State, StateSnapshot, SyncError,
    Syncer,
};

use crate::error::ReconcileError;

/// Programs packet forwarding.
pub const FORWARDING: &str = "forwarding";
/// Programs firewall rules.
pub const FIREWALL: &str = "firewall";
/// Advertises anycast routes.
pub const ROUTING: &str = "routing";
/// Claims the virtual addresses.
pub const VIP: &str = "vip";

/// When a stage is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// On every pass.
    Always,
    /// Only while this instance leads the cluster.
    LeaderOnly,
}

impl Gate {
    fn admits(self, leadership: Leadership) -> bool {
        match self {
            Self::Always => true,
            Self::LeaderOnly => leadership.is_leader(),
        }
    }
}

/// One named step of a reconcile pass.
#[derive(Clone)]
pub struct Stage {
    name: &'static str,
    gate: Gate,
    syncer: Arc<dyn Syncer>,
}

impl Stage {
    /// Create a stage.
    pub fn new(name: &'static str, gate: Gate, syncer: Arc<dyn Syncer>) -> Self {
        Self { name, gate, syncer }
    }

    /// The stage name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The stage's gate.
    pub fn gate(&self) -> Gate {
        self.gate
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Lets a route advertiser sit in a stage list.
struct RoutingStage(Arc<dyn RoutingSyncer>);

#[async_trait]
impl Syncer for RoutingStage {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        self.0.sync(state).await
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Stages that ran, in order.
    pub ran: Vec<&'static str>,
    /// The gated stage the pass stopped at, if any.
    pub gated_at: Option<&'static str>,
}

/// The ordered stage list.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    sync_timeout: Duration,
    leadership_lock: Arc<Mutex<()>>,
}

impl Pipeline {
    /// A pipeline running `stages` in order.
    pub fn new(stages: Vec<Stage>, sync_timeout: Duration) -> Self {
        Self {
            stages,
            sync_timeout,
            leadership_lock: Arc::new(Mutex::new(())),
        }
    }

    /// `forwarding → firewall → vip`, with the VIP stage leader-only.
    pub fn unicast(
        forwarding: Arc<dyn Syncer>,
        firewall: Arc<dyn Syncer>,
        vip: Arc<dyn Syncer>,
        sync_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Stage::new(FORWARDING, Gate::Always, forwarding),
                Stage::new(FIREWALL, Gate::Always, firewall),
                Stage::new(VIP, Gate::LeaderOnly, vip),
            ],
            sync_timeout,
        )
    }

    /// `forwarding → firewall → routing → vip`, all ungated.
    pub fn anycast(
        forwarding: Arc<dyn Syncer>,
        firewall: Arc<dyn Syncer>,
        routing: Arc<dyn RoutingSyncer>,
        vip: Arc<dyn Syncer>,
        sync_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Stage::new(FORWARDING, Gate::Always, forwarding),
                Stage::new(FIREWALL, Gate::Always, firewall),
                Stage::new(ROUTING, Gate::Always, Arc::new(RoutingStage(routing))),
                Stage::new(VIP, Gate::Always, vip),
            ],
            sync_timeout,
        )
    }

    /// The stages in run order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The lock held across every leader-only stage.
    ///
    /// Whoever changes this instance's leadership takes it first, so a
    /// gated stage never runs against a standing that has since changed.
    pub fn leadership_lock(&self) -> Arc<Mutex<()>> {
        self.leadership_lock.clone()
    }

    /// Run one pass against `snapshot`, consulting `leadership` at each
    /// gated stage.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, including a sync that outlives the
    /// timeout.
    pub async fn run(
        &self,
        snapshot: &StateSnapshot,
        leadership: &watch::Receiver<Leadership>,
    ) -> Result<PassReport, ReconcileError> {
        let mut report = PassReport::default();
        for stage in &self.stages {
            let _held: Option<MutexGuard<'_, ()>> = match stage.gate {
                Gate::Always => None,
                Gate::LeaderOnly => Some(self.leadership_lock.lock().await),
            };
            let standing = *leadership.borrow();
            if !stage.gate.admits(standing) {
                debug!(stage = stage.name, %standing, "stage gated");
                report.gated_at = Some(stage.name);
                break;
            }
            timed_sync(stage.syncer.as_ref(), snapshot, self.sync_timeout)
                .await
                .map_err(|source| ReconcileError {
                    stage: stage.name,
                    source,
                })?;
            report.ran.push(stage.name);
        }
        Ok(report)
    }
}

/// Run `syncer` against `snapshot`, giving up after `limit`.
pub(crate) async fn timed_sync(
    syncer: &dyn Syncer,
    snapshot: &StateSnapshot,
    limit: Duration,
) -> Result<(), SyncError> {
    tokio::time::timeout(limit, syncer.sync(snapshot))
        .await
        .map_err(|_| SyncError::Timeout(limit))?
}

/// Counters for reconcile passes.
#[derive(Debug, Default)]
pub struct ReconcileStats {
    passes: AtomicU64,
    failures: AtomicU64,
    last_failed_stage: ArcSwapOption<&'static str>,
}

/// A point-in-time copy of [`ReconcileStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Passes run, successful or not.
    pub passes: u64,
    /// Passes that ended in a stage failure.
    pub failures: u64,
    /// The stage that failed most recently.
    pub last_failed_stage: Option<&'static str>,
}

impl ReconcileStats {
    fn record(&self, outcome: &Result<PassReport, ReconcileError>) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = outcome {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.last_failed_stage.store(Some(Arc::new(e.stage)));
        }
    }

    /// Read the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_failed_stage: self.last_failed_stage.load().as_deref().copied(),
        }
    }
}

/// Re-reads state and runs the pipeline once per change signal.
pub struct Reconciler {
    state: Arc<State>,
    pipeline: Pipeline,
    health: Option<Arc<dyn HealthMonitor>>,
    leadership: watch::Receiver<Leadership>,
    stats: Arc<ReconcileStats>,
}

impl Reconciler {
    /// Create a reconciler. Health filtering applies when `health` is set.
    pub fn new(
        state: Arc<State>,
        pipeline: Pipeline,
        health: Option<Arc<dyn HealthMonitor>>,
        leadership: watch::Receiver<Leadership>,
        stats: Arc<ReconcileStats>,
    ) -> Self {
        Self {
            state,
            pipeline,
            health,
            leadership,
            stats,
        }
    }

    /// Snapshot state, filter it and run one pass.
    ///
    /// # Errors
    ///
    /// Returns the failing stage, as [`Pipeline::run`] does.
    pub async fn pass(&self) -> Result<PassReport, ReconcileError> {
        let snapshot = self.state.copy();
        let effective = match &self.health {
            Some(monitor) => monitor.filter_healthy(&snapshot),
            None => snapshot,
        };
        let outcome = self.pipeline.run(&effective, &self.leadership).await;
        self.stats.record(&outcome);
        outcome
    }

    /// Run a pass for every change until `cancel` fires or every producer
    /// is gone. Pass failures are logged and retried on the next change.
    pub async fn run(self, mut changes: ChangeReceiver, cancel: CancellationToken) {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => change,
            };
            if change.is_none() {
                debug!("change channel closed");
                break;
            }

            match self.pass().await {
                Ok(report) => debug!(ran = ?report.ran, gated_at = ?report.gated_at, "reconciled"),
                Err(e) => error!(stage = e.stage, error = %e.source, "reconcile failed"),
            }
        }
        debug!("reconcile loop stopped");
    }
}
