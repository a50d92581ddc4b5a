//! The balancer: builds every collaborator in order and runs the
//! background tasks that keep the host in line with the store.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use meridian_core::{
    change_channel, Elector, HealthMonitor, Leadership, RoutingSyncer, State, Store, StoreError,
    SyncError, Syncer,
};
use meridian_store::MemoryStore;

use crate::config::BalancerConfig;
use crate::election::{ElectionWatcher, WatchOutcome};
use crate::error::BalancerError;
use crate::health_check::TcpHealthMonitor;
use crate::ipam::Allocator;
use crate::metrics;
use crate::net::{IpCommandNetOps, NetOps};
use crate::reconcile::{Pipeline, ReconcileStats, Reconciler, FIREWALL, FORWARDING, ROUTING, VIP};
use crate::syncers::{
    BgpSyncer, CommandRunner, DryRunRunner, IpvsSyncer, IptablesSyncer, SystemRunner, VipSyncer,
};

/// Builds the collaborators a [`Balancer`] drives.
#[async_trait]
pub trait Components: Send + Sync {
    /// Open the store client.
    async fn open_store(&self, config: &BalancerConfig) -> Result<Arc<dyn Store>, StoreError>;

    /// Build the forwarding syncer.
    async fn forwarding(&self, config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError>;

    /// Build the network-interface operations.
    fn net_ops(&self, config: &BalancerConfig) -> Arc<dyn NetOps>;

    /// Build the VIP syncer on top of `net`.
    async fn vip(
        &self,
        config: &BalancerConfig,
        net: Arc<dyn NetOps>,
    ) -> Result<Arc<dyn Syncer>, SyncError>;

    /// Build the firewall syncer.
    async fn firewall(&self, config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError>;

    /// Build the health monitor.
    fn health_monitor(&self, config: &BalancerConfig) -> Arc<dyn HealthMonitor>;

    /// Build the anycast route advertiser.
    async fn routing(&self, config: &BalancerConfig)
        -> Result<Arc<dyn RoutingSyncer>, SyncError>;
}

/// The collaborators used on a real host.
pub struct SystemComponents {
    runner: Arc<dyn CommandRunner>,
}

impl SystemComponents {
    /// Run host tools, or only log them when `dry_run` is set.
    pub fn new(dry_run: bool) -> Self {
        let runner: Arc<dyn CommandRunner> = if dry_run {
            Arc::new(DryRunRunner)
        } else {
            Arc::new(SystemRunner)
        };
        Self { runner }
    }
}

#[async_trait]
impl Components for SystemComponents {
    async fn open_store(&self, config: &BalancerConfig) -> Result<Arc<dyn Store>, StoreError> {
        let store = match &config.store.seed {
            Some(path) => MemoryStore::from_seed_file(path)?,
            None => MemoryStore::new(),
        };
        Ok(Arc::new(store))
    }

    async fn forwarding(&self, _config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError> {
        Ok(Arc::new(IpvsSyncer::new(self.runner.clone()).await?))
    }

    fn net_ops(&self, _config: &BalancerConfig) -> Arc<dyn NetOps> {
        Arc::new(IpCommandNetOps::new(self.runner.clone()))
    }

    async fn vip(
        &self,
        config: &BalancerConfig,
        net: Arc<dyn NetOps>,
    ) -> Result<Arc<dyn Syncer>, SyncError> {
        Ok(Arc::new(VipSyncer::new(net, config.interfaces.inbound.clone())))
    }

    async fn firewall(&self, config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError> {
        let syncer = IptablesSyncer::new(
            self.runner.clone(),
            config.firewall.snat_address,
            config.interfaces.outbound.clone(),
        )
        .await?;
        Ok(Arc::new(syncer))
    }

    fn health_monitor(&self, config: &BalancerConfig) -> Arc<dyn HealthMonitor> {
        Arc::new(TcpHealthMonitor::new(&config.health))
    }

    async fn routing(
        &self,
        config: &BalancerConfig,
    ) -> Result<Arc<dyn RoutingSyncer>, SyncError> {
        Ok(Arc::new(BgpSyncer::new(self.runner.clone(), &config.bgp)))
    }
}

/// First fatal error raised by a background task.
#[derive(Debug, Default)]
struct FatalSlot(Mutex<Option<BalancerError>>);

impl FatalSlot {
    fn set(&self, err: BalancerError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<BalancerError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A running balancer.
pub struct Balancer {
    config: BalancerConfig,
    store: Arc<dyn Store>,
    elector: Arc<dyn Elector>,
    state: Arc<State>,
    allocator: Allocator,
    net: Arc<dyn NetOps>,
    leadership: watch::Receiver<Leadership>,
    stats: Arc<ReconcileStats>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    fatal: Arc<FatalSlot>,
}

impl Balancer {
    /// Build a balancer from host collaborators and start it.
    ///
    /// # Errors
    ///
    /// Returns the first construction step that fails.
    pub async fn new(config: BalancerConfig) -> Result<Self, BalancerError> {
        let components = SystemComponents::new(config.dry_run);
        Self::with_components(config, &components).await
    }

    /// Build a balancer from `components` and start it.
    ///
    /// Anything already started is stopped again when a later step fails.
    ///
    /// # Errors
    ///
    /// Returns the first construction step that fails.
    pub async fn with_components(
        config: BalancerConfig,
        components: &dyn Components,
    ) -> Result<Self, BalancerError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        match Self::build(config, components, &tasks, &cancel).await {
            Ok(balancer) => Ok(balancer),
            Err(e) => {
                cancel.cancel();
                tasks.close();
                tasks.wait().await;
                Err(e)
            }
        }
    }

    async fn build(
        config: BalancerConfig,
        components: &dyn Components,
        tasks: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Result<Self, BalancerError> {
        let store = components.open_store(&config).await?;

        let (changes, changes_rx) = change_channel();
        let state = State::replicate(store.as_ref(), changes.clone(), tasks, cancel.clone()).await?;

        let forwarding = components
            .forwarding(&config)
            .await
            .map_err(BalancerError::construct(FORWARDING))?;
        let net = components.net_ops(&config);
        let vip = components
            .vip(&config, net.clone())
            .await
            .map_err(BalancerError::construct(VIP))?;
        let firewall = components
            .firewall(&config)
            .await
            .map_err(BalancerError::construct(FIREWALL))?;
        let allocator = Allocator::new(state.clone(), config.ipam.ranges.clone())?;

        let health = if config.enable_health_checks {
            let monitor = components.health_monitor(&config);
            tasks.spawn({
                let monitor = monitor.clone();
                let state = state.clone();
                let cancel = cancel.clone();
                async move { monitor.monitor(state, changes, cancel).await }
            });
            Some(monitor)
        } else {
            drop(changes);
            None
        };

        let sync_timeout = config.reconcile.sync_timeout;
        let pipeline = if config.is_anycast() {
            let routing = components
                .routing(&config)
                .await
                .map_err(BalancerError::construct(ROUTING))?;
            tasks.spawn(serve_routing(routing.clone(), cancel.clone()));
            Pipeline::anycast(forwarding, firewall, routing, vip.clone(), sync_timeout)
        } else {
            Pipeline::unicast(forwarding, firewall, vip.clone(), sync_timeout)
        };

        net.del_vips(&config.interfaces.inbound)
            .await
            .map_err(BalancerError::Cleanup)?;

        let elector = store.elector();
        let events = elector
            .campaign(&config.election.key, &config.name, config.election.lease)
            .await?;
        let (leadership_tx, leadership) = watch::channel(Leadership::Pending);
        let fatal = Arc::new(FatalSlot::default());

        if config.is_anycast() {
            debug!("anycast mode, leadership does not move vips");
        } else {
            let watcher = ElectionWatcher::new(
                state.clone(),
                vip,
                net.clone(),
                config.interfaces.inbound.clone(),
                elector.clone(),
                config.election.key.clone(),
                config.name.clone(),
                sync_timeout,
                leadership_tx,
                pipeline.leadership_lock(),
            );
            let fatal = fatal.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let WatchOutcome::Fatal(e) = watcher.run(events, cancel.clone()).await {
                    error!(error = %e, "stopping balancer");
                    fatal.set(e);
                    cancel.cancel();
                }
            });
        }

        let stats = Arc::new(ReconcileStats::default());
        let reconciler = Reconciler::new(
            state.clone(),
            pipeline,
            health,
            leadership.clone(),
            stats.clone(),
        );
        tasks.spawn(reconciler.run(changes_rx, cancel.clone()));
        tasks.spawn(metrics::monitor(
            state.clone(),
            leadership.clone(),
            stats.clone(),
            config.metrics.interval,
            cancel.clone(),
        ));

        info!(
            name = %config.name,
            mode = ?config.cluster_mode,
            health_checks = config.enable_health_checks,
            "balancer started"
        );
        Ok(Self {
            config,
            store,
            elector,
            state,
            allocator,
            net,
            leadership,
            stats,
            tasks: tasks.clone(),
            cancel: cancel.clone(),
            fatal,
        })
    }

    /// Wait until every background task has stopped.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the balancer, if any.
    pub async fn wait(&self) -> Result<(), BalancerError> {
        self.tasks.close();
        self.tasks.wait().await;
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every background task, give up the candidacy and, if this
    /// instance led a unicast cluster, release its VIPs.
    pub async fn shutdown(&self) {
        let was_leader = self.is_leader();
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let election = &self.config.election;
        if let Err(e) = self.elector.resign(&election.key, &self.config.name).await {
            warn!(error = %e, "failed to resign candidacy");
        }
        if was_leader && !self.config.is_anycast() {
            if let Err(e) = self.net.del_vips(&self.config.interfaces.inbound).await {
                warn!(error = %e, "failed to release vips");
            }
        }
        info!("balancer stopped");
    }

    /// The replicated state.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// The store client.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The virtual address allocator.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// This instance's current standing.
    pub fn leadership(&self) -> Leadership {
        *self.leadership.borrow()
    }

    /// A handle that observes leadership changes.
    pub fn subscribe_leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership.clone()
    }

    /// Whether this instance currently leads.
    pub fn is_leader(&self) -> bool {
        self.leadership().is_leader()
    }

    /// Reconcile counters.
    pub fn stats(&self) -> &Arc<ReconcileStats> {
        &self.stats
    }

    /// The configuration the balancer was built with.
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }
}

async fn serve_routing(routing: Arc<dyn RoutingSyncer>, cancel: CancellationToken) {
    if let Err(e) = routing.serve(cancel).await {
        error!(error = %e, "route speaker failed");
    }
}
