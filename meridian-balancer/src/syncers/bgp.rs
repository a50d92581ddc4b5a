//! Anycast route advertisement through GoBGP.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_core::{RoutingSyncer, StateSnapshot, SyncError, Syncer};

use super::command::{args, CommandRunner};
use crate::config::BgpConfig;

fn host_prefix(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

fn family(prefix: &IpNet) -> &'static str {
    match prefix {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    }
}

/// Announces one host route per service address.
pub struct BgpSyncer {
    runner: Arc<dyn CommandRunner>,
    client: String,
    daemon: String,
    daemon_config: Option<PathBuf>,
    announced: Mutex<BTreeSet<IpNet>>,
}

impl BgpSyncer {
    /// Create a syncer that has announced nothing yet.
    pub fn new(runner: Arc<dyn CommandRunner>, config: &BgpConfig) -> Self {
        Self {
            runner,
            client: config.client.clone(),
            daemon: config.daemon.clone(),
            daemon_config: config.daemon_config.clone(),
            announced: Mutex::new(BTreeSet::new()),
        }
    }

    async fn rib(&self, verb: &str, prefix: &IpNet) -> Result<(), SyncError> {
        let argv = args([
            "global".to_string(),
            "rib".to_string(),
            verb.to_string(),
            "-a".to_string(),
            family(prefix).to_string(),
            prefix.to_string(),
        ]);
        self.runner.run(&self.client, &argv).await?;
        Ok(())
    }

    async fn withdraw_all(&self) {
        let mut announced = self.announced.lock().await;
        let prefixes: Vec<_> = announced.iter().copied().collect();
        for prefix in prefixes {
            match self.rib("del", &prefix).await {
                Ok(()) => {
                    announced.remove(&prefix);
                }
                Err(e) => warn!(%prefix, error = %e, "failed to withdraw route"),
            }
        }
    }
}

#[async_trait]
impl Syncer for BgpSyncer {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        let desired: BTreeSet<IpNet> = state.services().map(|s| host_prefix(s.address)).collect();
        let mut announced = self.announced.lock().await;

        let stale: Vec<_> = announced.difference(&desired).copied().collect();
        for prefix in stale {
            self.rib("del", &prefix).await?;
            announced.remove(&prefix);
        }
        let missing: Vec<_> = desired.difference(&announced).copied().collect();
        for prefix in missing {
            self.rib("add", &prefix).await?;
            announced.insert(prefix);
        }

        debug!(routes = announced.len(), "routes in sync");
        Ok(())
    }
}

#[async_trait]
impl RoutingSyncer for BgpSyncer {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        let outcome = match &self.daemon_config {
            Some(path) => {
                let argv = args(["-f".to_string(), path.display().to_string()]);
                info!(daemon = %self.daemon, config = %path.display(), "starting bgp speaker");
                self.runner
                    .supervise(&self.daemon, &argv, cancel.clone())
                    .await
                    .map_err(SyncError::from)
            }
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        };

        self.withdraw_all().await;
        info!("bgp speaker stopped");
        outcome
    }
}
