//! In-process store with full-collection change feeds.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use meridian_core::{
    Destination, DestinationId, Elector, Service, ServiceId, Store, StoreError,
};

use crate::election::MemoryElector;

/// Initial contents of a [`MemoryStore`], as read from a TOML seed file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedData {
    /// Services to load.
    pub services: Vec<Service>,
    /// Destinations to load.
    pub destinations: Vec<Destination>,
}

/// A store that lives entirely in this process.
///
/// Every mutation publishes the complete affected collection to every live
/// subscriber. Publishes are serialized so subscribers always receive the
/// newest collection last.
#[derive(Debug, Default)]
pub struct MemoryStore {
    services: DashMap<ServiceId, Service>,
    destinations: DashMap<DestinationId, Destination>,
    service_feeds: Mutex<Vec<mpsc::Sender<Vec<Service>>>>,
    destination_feeds: Mutex<Vec<mpsc::Sender<Vec<Destination>>>>,
    publish: tokio::sync::Mutex<()>,
    elector: Arc<MemoryElector>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with `seed`.
    pub fn with_seed(seed: SeedData) -> Self {
        let store = Self::new();
        for svc in seed.services {
            store.services.insert(svc.id(), svc);
        }
        for dst in seed.destinations {
            store.destinations.insert(dst.id(), dst);
        }
        store
    }

    /// Create a store pre-loaded from a TOML seed file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Seed`] if the file cannot be read or parsed.
    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))?;
        let seed: SeedData = toml::from_str(&content)
            .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            services = seed.services.len(),
            destinations = seed.destinations.len(),
            "loaded store seed"
        );
        Ok(Self::with_seed(seed))
    }

    /// The concrete election primitive backing this store.
    pub fn memory_elector(&self) -> &Arc<MemoryElector> {
        &self.elector
    }

    /// All stored services.
    pub fn services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// All stored destinations.
    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.iter().map(|e| e.value().clone()).collect()
    }

    async fn publish_services(&self) {
        let _guard = self.publish.lock().await;
        let batch = self.services();
        let feeds = live_feeds(&self.service_feeds);
        debug!(count = batch.len(), subscribers = feeds.len(), "publishing services");
        fan_out(&feeds, batch).await;
    }

    async fn publish_destinations(&self) {
        let _guard = self.publish.lock().await;
        let batch = self.destinations();
        let feeds = live_feeds(&self.destination_feeds);
        debug!(count = batch.len(), subscribers = feeds.len(), "publishing destinations");
        fan_out(&feeds, batch).await;
    }
}

/// Prune closed subscribers and clone out the rest, so no lock is held
/// while sending.
fn live_feeds<T>(feeds: &Mutex<Vec<mpsc::Sender<T>>>) -> Vec<mpsc::Sender<T>> {
    let mut feeds = feeds.lock().unwrap_or_else(PoisonError::into_inner);
    feeds.retain(|tx| !tx.is_closed());
    feeds.clone()
}

async fn fan_out<T: Clone>(feeds: &[mpsc::Sender<T>], batch: T) {
    for tx in feeds {
        // A subscriber that went away is pruned on the next publish.
        let _ = tx.send(batch.clone()).await;
    }
}

fn subscribe<T: Clone>(
    feeds: &Mutex<Vec<mpsc::Sender<T>>>,
    updates: &mpsc::Sender<T>,
    collection: &'static str,
    initial: T,
) -> Result<(), StoreError> {
    updates
        .try_send(initial)
        .map_err(|e| StoreError::Subscription {
            collection,
            reason: e.to_string(),
        })?;
    feeds
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(updates.clone());
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn subscribe_services(
        &self,
        updates: mpsc::Sender<Vec<Service>>,
    ) -> Result<(), StoreError> {
        let _guard = self.publish.lock().await;
        subscribe(&self.service_feeds, &updates, "services", self.services())
    }

    async fn subscribe_destinations(
        &self,
        updates: mpsc::Sender<Vec<Destination>>,
    ) -> Result<(), StoreError> {
        let _guard = self.publish.lock().await;
        subscribe(
            &self.destination_feeds,
            &updates,
            "destinations",
            self.destinations(),
        )
    }

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError> {
        self.services.insert(service.id(), service);
        self.publish_services().await;
        Ok(())
    }

    async fn delete_service(&self, id: &ServiceId) -> Result<(), StoreError> {
        self.services.remove(id);
        let before = self.destinations.len();
        self.destinations.retain(|_, d| &d.service_id != id);
        let cascaded = before != self.destinations.len();

        self.publish_services().await;
        if cascaded {
            self.publish_destinations().await;
        }
        Ok(())
    }

    async fn upsert_destination(&self, destination: Destination) -> Result<(), StoreError> {
        self.destinations.insert(destination.id(), destination);
        self.publish_destinations().await;
        Ok(())
    }

    async fn delete_destination(&self, id: &DestinationId) -> Result<(), StoreError> {
        self.destinations.remove(id);
        self.publish_destinations().await;
        Ok(())
    }

    fn elector(&self) -> Arc<dyn Elector> {
        Arc::clone(&self.elector) as Arc<dyn Elector>
    }
}
