//! Leadership transitions and their side effects on the VIPs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meridian_core::{ElectionEvents, Elector, Leadership, State, Syncer};

use crate::error::BalancerError;
use crate::net::NetOps;
use crate::reconcile::timed_sync;

/// Why the watcher stopped.
#[derive(Debug)]
pub enum WatchOutcome {
    /// Cancelled, or the election feed closed.
    Stopped,
    /// This instance could not claim its VIPs after winning the election.
    /// The candidacy has already been resigned.
    Fatal(BalancerError),
}

/// Consumes election transitions for one candidacy and applies their VIP
/// side effects.
pub struct ElectionWatcher {
    state: Arc<State>,
    vip: Arc<dyn Syncer>,
    net: Arc<dyn NetOps>,
    iface: String,
    elector: Arc<dyn Elector>,
    key: String,
    candidate: String,
    sync_timeout: Duration,
    leadership: watch::Sender<Leadership>,
    leadership_lock: Arc<Mutex<()>>,
}

impl ElectionWatcher {
    /// Create a watcher that publishes the current standing on
    /// `leadership`.
    ///
    /// `leadership_lock` is the reconcile pipeline's
    /// [`leadership_lock`](crate::reconcile::Pipeline::leadership_lock); it
    /// is held while a transition is applied.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<State>,
        vip: Arc<dyn Syncer>,
        net: Arc<dyn NetOps>,
        iface: impl Into<String>,
        elector: Arc<dyn Elector>,
        key: impl Into<String>,
        candidate: impl Into<String>,
        sync_timeout: Duration,
        leadership: watch::Sender<Leadership>,
        leadership_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            state,
            vip,
            net,
            iface: iface.into(),
            elector,
            key: key.into(),
            candidate: candidate.into(),
            sync_timeout,
            leadership,
            leadership_lock,
        }
    }

    /// Handle transitions until `cancel` fires or `events` closes.
    pub async fn run(self, mut events: ElectionEvents, cancel: CancellationToken) -> WatchOutcome {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return WatchOutcome::Stopped,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                warn!(key = %self.key, "election feed closed");
                return WatchOutcome::Stopped;
            };

            match event {
                Leadership::Leader => {
                    if let Err(e) = self.on_elected().await {
                        return WatchOutcome::Fatal(e);
                    }
                }
                Leadership::Follower | Leadership::Pending => self.on_demoted().await,
            }
        }
    }

    async fn on_elected(&self) -> Result<(), BalancerError> {
        info!(candidate = %self.candidate, "elected leader");
        let snapshot = self.state.copy();

        {
            let _held = self.leadership_lock.lock().await;
            if let Err(e) = timed_sync(self.vip.as_ref(), &snapshot, self.sync_timeout).await {
                error!(error = %e, "leader could not claim its vips, resigning");
                self.leadership.send_replace(Leadership::Follower);
                if let Err(resign) = self.elector.resign(&self.key, &self.candidate).await {
                    warn!(error = %resign, "failed to resign");
                }
                return Err(BalancerError::LeadershipFatal(e));
            }
            self.leadership.send_replace(Leadership::Leader);
        }

        for svc in snapshot.services() {
            if !svc.address.is_ipv4() {
                debug!(service = %svc.name, address = %svc.address, "no arp for ipv6, skipping");
                continue;
            }
            if let Err(e) = self.net.send_gratuitous_arp(svc.address, &self.iface).await {
                warn!(service = %svc.name, address = %svc.address, error = %e, "gratuitous arp failed");
            }
        }
        Ok(())
    }

    async fn on_demoted(&self) {
        let _held = self.leadership_lock.lock().await;
        let was_leader = self.leadership.send_replace(Leadership::Follower).is_leader();
        info!(candidate = %self.candidate, was_leader, "not the leader");

        // TODO: evict this instance from the cluster when the flush fails.
        if let Err(e) = self.net.del_vips(&self.iface).await {
            error!(iface = %self.iface, error = %e, "failed to flush vips");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::IpAddr;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use meridian_core::{Service, StateSnapshot, SyncError};
    use meridian_store::MemoryElector;
    use tokio::sync::mpsc;

    use crate::error::NetError;

    #[derive(Default)]
    struct Net(StdMutex<Vec<String>>);

    impl Net {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetOps for Net {
        async fn list_vips(&self, _iface: &str) -> Result<BTreeSet<IpAddr>, NetError> {
            Ok(BTreeSet::new())
        }

        async fn add_vip(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
            self.0.lock().unwrap().push(format!("add {addr}"));
            Ok(())
        }

        async fn del_vip(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
            self.0.lock().unwrap().push(format!("del {addr}"));
            Ok(())
        }

        async fn del_vips(&self, _iface: &str) -> Result<(), NetError> {
            self.0.lock().unwrap().push("flush".to_string());
            Ok(())
        }

        async fn send_gratuitous_arp(&self, addr: IpAddr, _iface: &str) -> Result<(), NetError> {
            self.0.lock().unwrap().push(format!("arp {addr}"));
            Ok(())
        }
    }

    struct Claim;

    #[async_trait]
    impl Syncer for Claim {
        async fn sync(&self, _state: &StateSnapshot) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn watcher(
        state: Arc<State>,
        net: Arc<Net>,
        lock: Arc<Mutex<()>>,
    ) -> (ElectionWatcher, watch::Receiver<Leadership>) {
        let (tx, rx) = watch::channel(Leadership::Pending);
        let watcher = ElectionWatcher::new(
            state,
            Arc::new(Claim),
            net,
            "eth0",
            Arc::new(MemoryElector::new()),
            "meridian/leader",
            "meridian",
            Duration::from_secs(1),
            tx,
            lock,
        );
        (watcher, rx)
    }

    #[tokio::test]
    async fn test_arp_only_for_ipv4_services() {
        let state = Arc::new(State::new());
        state.add_service(Service::new("web", "10.0.0.1".parse().unwrap(), 80));
        state.add_service(Service::new("web6", "fd00::1".parse().unwrap(), 80));
        let net = Arc::new(Net::default());
        let (watcher, standing) = watcher(state, net.clone(), Arc::new(Mutex::new(())));

        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(Leadership::Leader).unwrap();
        drop(events_tx);

        let outcome = watcher.run(events, CancellationToken::new()).await;
        assert!(matches!(outcome, WatchOutcome::Stopped));
        assert_eq!(*standing.borrow(), Leadership::Leader);
        assert_eq!(net.calls(), vec!["arp 10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_demotion_waits_for_gated_stage() {
        let net = Arc::new(Net::default());
        let lock = Arc::new(Mutex::new(()));
        let (watcher, standing) = watcher(Arc::new(State::new()), net.clone(), lock.clone());

        let (events_tx, events) = mpsc::unbounded_channel();
        events_tx.send(Leadership::Leader).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(events, cancel.clone()));
        let mut leading = standing.clone();
        leading.wait_for(Leadership::is_leader).await.unwrap();

        // A VIP stage is in flight.
        let held = lock.clone().lock_owned().await;
        events_tx.send(Leadership::Follower).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(standing.borrow().is_leader());
        assert!(net.calls().is_empty());

        drop(held);
        let mut following = standing.clone();
        following.wait_for(|l| *l == Leadership::Follower).await.unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(net.calls(), vec!["flush"]);
    }
}
