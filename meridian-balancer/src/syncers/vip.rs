//! Virtual addresses on the inbound interface.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use meridian_core::{StateSnapshot, SyncError, Syncer};

use crate::net::NetOps;

/// Keeps the VIPs on one interface equal to the service addresses in
/// state.
///
/// The live address list is read on every pass, so a flush done outside
/// the syncer is repaired on the next one. Passes are serialized, so two
/// callers never race on the same address.
pub struct VipSyncer {
    net: Arc<dyn NetOps>,
    iface: String,
    serial: Mutex<()>,
}

impl VipSyncer {
    /// Manage the VIPs of `iface`.
    pub fn new(net: Arc<dyn NetOps>, iface: impl Into<String>) -> Self {
        Self {
            net,
            iface: iface.into(),
            serial: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Syncer for VipSyncer {
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError> {
        let mut desired = BTreeSet::new();
        for svc in state.services() {
            if svc.address.is_ipv4() {
                desired.insert(svc.address);
            } else {
                debug!(service = %svc.name, address = %svc.address, "ipv6 vips are not labelled, skipping");
            }
        }

        let _serial = self.serial.lock().await;
        let live = self.net.list_vips(&self.iface).await?;
        let stale: Vec<IpAddr> = live.difference(&desired).copied().collect();
        for addr in stale {
            self.net.del_vip(addr, &self.iface).await?;
        }
        let missing: Vec<IpAddr> = desired.difference(&live).copied().collect();
        for addr in missing {
            self.net.add_vip(addr, &self.iface).await?;
        }
        Ok(())
    }
}
