//! Integration tests driving a whole balancer through recording collaborators.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use meridian_balancer::{
    Balancer, BalancerConfig, BalancerError, ClusterMode, CommandError, Components, NetError,
    NetOps,
};
use meridian_core::{
    Elector, HealthMonitor, RoutingSyncer, Service, StateSnapshot, Store, StoreError, SyncError,
    Syncer,
};
use meridian_store::MemoryStore;

const KEY: &str = "meridian/leader";
const LEASE: Duration = Duration::from_secs(20);

/// Every collaborator call, in the order it happened.
#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }
}

struct RecordingSyncer {
    name: &'static str,
    log: Arc<Log>,
    fail: AtomicBool,
    delay: Duration,
    last: Mutex<Option<StateSnapshot>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSyncer {
    fn new(name: &'static str, log: &Arc<Log>) -> Arc<Self> {
        Self::slow(name, log, Duration::ZERO)
    }

    fn slow(name: &'static str, log: &Arc<Log>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: log.clone(),
            fail: AtomicBool::new(false),
            delay,
            last: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn last_service_count(&self) -> Option<usize> {
        self.last.lock().unwrap().as_ref().map(StateSnapshot::service_count)
    }
}

#[async_trait]
impl Syncer for RecordingSyncer {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        self.log.push(self.name);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Backend(format!("{} is broken", self.name)));
        }
        *self.last.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[async_trait]
impl RoutingSyncer for RecordingSyncer {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        cancel.cancelled().await;
        Ok(())
    }
}

struct RecordingNet {
    log: Arc<Log>,
    fail_arp: Option<IpAddr>,
    fail_flush: AtomicBool,
}

fn net_failure(what: &str) -> NetError {
    NetError::Command(CommandError {
        command: what.to_string(),
        reason: "exit status: 1".to_string(),
    })
}

#[async_trait]
impl NetOps for RecordingNet {
    async fn list_vips(&self, _iface: &str) -> Result<BTreeSet<IpAddr>, NetError> {
        Ok(BTreeSet::new())
    }

    async fn add_vip(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
        self.log.push(format!("add {addr}"));
        Ok(())
    }

    async fn del_vip(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
        self.log.push(format!("del {addr}"));
        Ok(())
    }

    async fn del_vips(&self, _iface: &str) -> Result<(), NetError> {
        self.log.push("flush");
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(net_failure("flush"));
        }
        Ok(())
    }

    async fn send_gratuitous_arp(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
        self.log.push(format!("arp {addr}"));
        if self.fail_arp == Some(addr) {
            return Err(net_failure("arping"));
        }
        Ok(())
    }
}

struct NoHealth;

#[async_trait]
impl HealthMonitor for NoHealth {
    fn filter_healthy(&self, snapshot: &StateSnapshot) -> StateSnapshot {
        snapshot.clone()
    }

    async fn monitor(
        &self,
        _state: Arc<meridian_core::State>,
        _changes: meridian_core::ChangeSender,
        cancel: CancellationToken,
    ) {
        cancel.cancelled().await;
    }
}

struct Fakes {
    store: Arc<MemoryStore>,
    log: Arc<Log>,
    forwarding: Arc<RecordingSyncer>,
    firewall: Arc<RecordingSyncer>,
    routing: Arc<RecordingSyncer>,
    vip: Arc<RecordingSyncer>,
    net: Arc<RecordingNet>,
    broken_component: Option<&'static str>,
}

impl Fakes {
    fn new() -> Self {
        Self::with_net(None)
    }

    fn with_net(fail_arp: Option<IpAddr>) -> Self {
        let log = Arc::new(Log::default());
        Self {
            store: Arc::new(MemoryStore::new()),
            forwarding: RecordingSyncer::new("forwarding", &log),
            firewall: RecordingSyncer::new("firewall", &log),
            routing: RecordingSyncer::new("routing", &log),
            vip: RecordingSyncer::new("vip", &log),
            net: Arc::new(RecordingNet {
                log: log.clone(),
                fail_arp,
                fail_flush: AtomicBool::new(false),
            }),
            broken_component: None,
            log,
        }
    }

    fn build<T>(&self, name: &'static str, syncer: Arc<T>) -> Result<Arc<T>, SyncError> {
        if self.broken_component == Some(name) {
            return Err(SyncError::Backend(format!("{name} unavailable")));
        }
        Ok(syncer)
    }

    fn elector(&self) -> Arc<dyn Elector> {
        self.store.elector()
    }
}

#[async_trait]
impl Components for Fakes {
    async fn open_store(&self, _config: &BalancerConfig) -> Result<Arc<dyn Store>, StoreError> {
        Ok(self.store.clone())
    }

    async fn forwarding(&self, _config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError> {
        Ok(self.build("forwarding", self.forwarding.clone())?)
    }

    fn net_ops(&self, _config: &BalancerConfig) -> Arc<dyn NetOps> {
        self.net.clone()
    }

    async fn vip(
        &self,
        _config: &BalancerConfig,
        _net: Arc<dyn NetOps>,
    ) -> Result<Arc<dyn Syncer>, SyncError> {
        Ok(self.build("vip", self.vip.clone())?)
    }

    async fn firewall(&self, _config: &BalancerConfig) -> Result<Arc<dyn Syncer>, SyncError> {
        Ok(self.build("firewall", self.firewall.clone())?)
    }

    fn health_monitor(&self, _config: &BalancerConfig) -> Arc<dyn HealthMonitor> {
        Arc::new(NoHealth)
    }

    async fn routing(
        &self,
        _config: &BalancerConfig,
    ) -> Result<Arc<dyn RoutingSyncer>, SyncError> {
        Ok(self.build("routing", self.routing.clone())?)
    }
}

fn config(mode: ClusterMode) -> BalancerConfig {
    BalancerConfig {
        cluster_mode: mode,
        ..BalancerConfig::default()
    }
}

fn service(name: &str, last: u8) -> Service {
    Service::new(name, IpAddr::from([10, 0, 0, last]), 80)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Start a balancer that joins behind an already elected peer.
async fn start_follower(fakes: &Fakes, mode: ClusterMode) -> (Balancer, meridian_core::ElectionEvents) {
    let peer = fakes.elector().campaign(KEY, "peer", LEASE).await.unwrap();
    let balancer = Balancer::with_components(config(mode), fakes).await.unwrap();
    (balancer, peer)
}

#[tokio::test]
async fn test_follower_pass_skips_vip() {
    let fakes = Fakes::new();
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;
    eventually("follower standing", || !balancer.is_leader() && fakes.log.count("flush") == 2).await;

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("a pass with the new service", || {
        fakes.firewall.last_service_count() == Some(1)
    })
    .await;
    settle().await;

    let entries = fakes.log.entries();
    assert!(entries.iter().any(|e| e == "forwarding"));
    assert!(!entries.iter().any(|e| e == "vip"));
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_leader_pass_runs_all_three_in_order() {
    let fakes = Fakes::new();
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;
    eventually("follower standing", || fakes.log.count("flush") == 2).await;

    fakes.elector().resign(KEY, "peer").await.unwrap();
    eventually("leadership", || balancer.is_leader()).await;
    settle().await;
    fakes.log.clear();

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("a vip pass", || fakes.vip.last_service_count() == Some(1)).await;
    settle().await;

    let entries = fakes.log.entries();
    assert!(!entries.is_empty());
    for pass in entries.chunks(3) {
        assert_eq!(pass, ["forwarding", "firewall", "vip"]);
    }
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_anycast_follower_still_programs_vips() {
    let fakes = Fakes::new();
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Anycast).await;

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("a vip pass", || fakes.vip.last_service_count() == Some(1)).await;
    settle().await;

    assert!(!balancer.is_leader());
    let forwarding = fakes.log.position("forwarding").unwrap();
    let routing = fakes.log.position("routing").unwrap();
    let vip = fakes.log.position("vip").unwrap();
    assert!(forwarding < routing && routing < vip);
    // Only the start-up cleanup: leadership never touches anycast vips.
    assert_eq!(fakes.log.count("flush"), 1);
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_election_claims_vips_before_announcing() {
    let fakes = Fakes::with_net(Some(IpAddr::from([10, 0, 0, 1])));
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;
    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    fakes.store.upsert_service(service("dns", 2)).await.unwrap();
    eventually("both services replicated", || {
        balancer.state().get_services().len() == 2
    })
    .await;
    settle().await;
    fakes.log.clear();

    fakes.elector().resign(KEY, "peer").await.unwrap();
    eventually("both announcements", || {
        fakes.log.count("arp 10.0.0.1") == 1 && fakes.log.count("arp 10.0.0.2") == 1
    })
    .await;

    let vip = fakes.log.position("vip").unwrap();
    let first_arp = fakes.log.position("arp ").unwrap();
    assert!(vip < first_arp);
    assert!(balancer.is_leader(), "a failed announcement is not fatal");
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_losing_leadership_flushes_once() {
    let fakes = Fakes::new();
    let balancer = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .unwrap();
    let _peer = fakes.elector().campaign(KEY, "peer", LEASE).await.unwrap();
    eventually("leadership", || balancer.is_leader()).await;
    settle().await;
    fakes.log.clear();

    fakes.store.memory_elector().expire(KEY);
    eventually("follower standing", || !balancer.is_leader()).await;
    settle().await;
    assert_eq!(fakes.log.count("flush"), 1);
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_demotion_during_a_pass_keeps_vips_released() {
    let mut fakes = Fakes::new();
    fakes.forwarding = RecordingSyncer::slow("forwarding", &fakes.log, Duration::from_millis(200));
    let balancer = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .unwrap();
    let _peer = fakes.elector().campaign(KEY, "peer", LEASE).await.unwrap();
    eventually("leadership", || balancer.is_leader()).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    fakes.log.clear();

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("forwarding in flight", || fakes.log.count("forwarding") == 1).await;
    fakes.store.memory_elector().expire(KEY);
    eventually("follower standing", || !balancer.is_leader()).await;
    eventually("the pass finished", || fakes.firewall.last_service_count() == Some(1)).await;
    settle().await;

    assert_eq!(fakes.log.count("flush"), 1);
    assert_eq!(fakes.log.count("vip"), 0, "a follower must not claim vips");
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_reelection_waits_for_in_flight_vip_stage() {
    let mut fakes = Fakes::new();
    fakes.vip = RecordingSyncer::slow("vip", &fakes.log, Duration::from_millis(200));
    let balancer = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .unwrap();
    eventually("leadership", || balancer.is_leader()).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    fakes.log.clear();

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("vip stage in flight", || fakes.log.count("vip") == 1).await;
    // The sole candidate loses the lease and gets it straight back.
    fakes.store.memory_elector().expire(KEY);
    eventually("vips claimed again", || fakes.log.count("vip") == 2).await;
    eventually("leadership", || balancer.is_leader()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(fakes.vip.max_in_flight.load(Ordering::SeqCst), 1);
    let entries = fakes.log.entries();
    let first = entries.iter().position(|e| e == "vip").unwrap();
    let flush = entries.iter().position(|e| e == "flush").unwrap();
    let second = entries.iter().rposition(|e| e == "vip").unwrap();
    assert!(first < flush && flush < second, "{entries:?}");
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_vip_failure_on_election_is_fatal() {
    let fakes = Fakes::new();
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;
    eventually("follower standing", || fakes.log.count("flush") == 2).await;
    fakes.vip.fail.store(true, Ordering::SeqCst);

    fakes.elector().resign(KEY, "peer").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), balancer.wait())
        .await
        .unwrap();

    assert!(matches!(result, Err(BalancerError::LeadershipFatal(_))));
    assert!(!balancer.is_leader());
    assert_eq!(fakes.store.memory_elector().leader(KEY), None);
    assert_eq!(fakes.log.count("arp 10.0.0.1"), 0);
}

#[tokio::test]
async fn test_burst_converges_to_latest_state() {
    let mut fakes = Fakes::new();
    fakes.forwarding = RecordingSyncer::slow("forwarding", &fakes.log, Duration::from_millis(30));
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;

    for i in 0..20u8 {
        fakes
            .store
            .upsert_service(service(&format!("svc-{i}"), i + 1))
            .await
            .unwrap();
    }
    eventually("the last service reconciled", || {
        fakes.firewall.last_service_count() == Some(20)
    })
    .await;

    let stats = balancer.stats().snapshot();
    assert!(stats.passes >= 1);
    assert_eq!(stats.failures, 0);
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_stage_failure_is_counted_and_retried() {
    let fakes = Fakes::new();
    let (balancer, _peer) = start_follower(&fakes, ClusterMode::Unicast).await;
    fakes.forwarding.fail.store(true, Ordering::SeqCst);

    fakes.store.upsert_service(service("web", 1)).await.unwrap();
    eventually("a failed pass", || balancer.stats().snapshot().failures >= 1).await;
    assert_eq!(balancer.stats().snapshot().last_failed_stage, Some("forwarding"));
    assert_eq!(fakes.firewall.last_service_count(), None);

    fakes.forwarding.fail.store(false, Ordering::SeqCst);
    fakes.store.upsert_service(service("dns", 2)).await.unwrap();
    eventually("recovery", || fakes.firewall.last_service_count() == Some(2)).await;
    balancer.shutdown().await;
}

#[tokio::test]
async fn test_construction_failure_names_the_component() {
    let mut fakes = Fakes::new();
    fakes.broken_component = Some("firewall");
    let err = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BalancerError::Construct { component: "firewall", .. }));
    assert_eq!(fakes.log.count("flush"), 0);
}

#[tokio::test]
async fn test_cleanup_failure_aborts_start() {
    let fakes = Fakes::new();
    fakes.net.fail_flush.store(true, Ordering::SeqCst);
    let err = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BalancerError::Cleanup(_)));
    assert_eq!(fakes.store.memory_elector().leader(KEY), None);
}

#[tokio::test]
async fn test_shutdown_releases_leadership() {
    let fakes = Fakes::new();
    let balancer = Balancer::with_components(config(ClusterMode::Unicast), &fakes)
        .await
        .unwrap();
    eventually("leadership", || balancer.is_leader()).await;
    settle().await;
    fakes.log.clear();

    balancer.shutdown().await;
    assert_eq!(fakes.log.count("flush"), 1);
    assert_eq!(fakes.store.memory_elector().leader(KEY), None);
    assert!(balancer.wait().await.is_ok());
}
