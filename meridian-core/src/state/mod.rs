//! The replicated state cache.
//!
//! [`State`] mirrors the store's service and destination collections in
//! memory. Two independent watchers (see [`watch`]) overwrite it whenever
//! the store publishes a new collection, then emit a [`Change`] so the
//! reconcile loop re-reads it.
//!
//! Every read hands out copies: mutating a returned `Service` never
//! touches the stored map.
//!
//! [`Change`]: crate::signal::Change

mod watch;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::destination::{Destination, DestinationId};
use crate::domain::service::{Service, ServiceId};
use crate::domain::snapshot::StateSnapshot;
use crate::error::{StateError, StoreError};
use crate::signal::ChangeSender;
use crate::store::Store;

/// Capacity of each store feed channel.
const FEED_CAPACITY: usize = 16;

/// A mutex-protected mirror of the store's services and destinations.
#[derive(Debug, Default)]
pub struct State {
    inner: RwLock<StateSnapshot>,
}

impl State {
    /// Create an empty state that is not bound to any store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state replicated from `store`.
    ///
    /// Subscribes to both collection feeds and spawns one watcher per feed
    /// on `tasks`. Each watcher stops when `cancel` fires or its feed
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns an error if either subscription cannot be established.
    pub async fn replicate(
        store: &dyn Store,
        changes: ChangeSender,
        tasks: &TaskTracker,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, StoreError> {
        let state = Arc::new(Self::new());

        let (svc_tx, svc_rx) = mpsc::channel(FEED_CAPACITY);
        store.subscribe_services(svc_tx).await?;
        let (dst_tx, dst_rx) = mpsc::channel(FEED_CAPACITY);
        store.subscribe_destinations(dst_tx).await?;

        tasks.spawn(watch::watch_feed(
            Arc::clone(&state),
            "services",
            svc_rx,
            State::replace_services,
            changes.clone(),
            cancel.clone(),
        ));
        tasks.spawn(watch::watch_feed(
            Arc::clone(&state),
            "destinations",
            dst_rx,
            State::replace_destinations,
            changes,
            cancel,
        ));

        Ok(state)
    }

    fn read(&self) -> RwLockReadGuard<'_, StateSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// All known services, in unspecified order.
    pub fn get_services(&self) -> Vec<Service> {
        self.read().services.values().cloned().collect()
    }

    /// Look up one service.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ServiceNotFound`] if `id` is unknown.
    pub fn get_service(&self, id: &ServiceId) -> Result<Service, StateError> {
        self.read().service(id).cloned()
    }

    /// Insert or replace a service, keyed by its identifier.
    pub fn add_service(&self, service: Service) {
        self.write().services.insert(service.id(), service);
    }

    /// Remove a service. Removing an unknown service is a no-op.
    pub fn delete_service(&self, service: &Service) {
        self.write().services.remove(&service.id());
    }

    /// All destinations bound to `service`.
    pub fn get_destinations(&self, service: &Service) -> Vec<Destination> {
        self.read().destinations_of(service).cloned().collect()
    }

    /// Look up one destination.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::DestinationNotFound`] if `id` is unknown.
    pub fn get_destination(&self, id: &DestinationId) -> Result<Destination, StateError> {
        self.read().destination(id).cloned()
    }

    /// Insert or replace a destination, keyed by its identifier.
    pub fn add_destination(&self, destination: Destination) {
        self.write()
            .destinations
            .insert(destination.id(), destination);
    }

    /// Remove a destination. Removing an unknown destination is a no-op.
    pub fn delete_destination(&self, destination: &Destination) {
        self.write().destinations.remove(&destination.id());
    }

    /// An independent deep copy of the current contents.
    pub fn copy(&self) -> StateSnapshot {
        self.read().clone()
    }

    /// Replace the whole service map with `services`.
    ///
    /// Anything absent from `services` is gone afterwards.
    pub fn replace_services(&self, services: Vec<Service>) {
        let fresh = services.into_iter().map(|s| (s.id(), s)).collect();
        self.write().services = fresh;
    }

    /// Replace the whole destination map with `destinations`.
    ///
    /// Anything absent from `destinations` is gone afterwards.
    pub fn replace_destinations(&self, destinations: Vec<Destination>) {
        let fresh = destinations.into_iter().map(|d| (d.id(), d)).collect();
        self.write().destinations = fresh;
    }
}
