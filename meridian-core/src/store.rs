//! The distributed store contract.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::destination::{Destination, DestinationId};
use crate::domain::service::{Service, ServiceId};
use crate::error::StoreError;
use crate::leadership::Elector;

/// A key-value store holding services and destinations, with change feeds.
///
/// Every feed delivery is the *full* collection, never a diff.
#[async_trait]
pub trait Store: Send + Sync {
    /// Deliver the full service collection on `updates` now and after
    /// every change, until the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe_services(
        &self,
        updates: mpsc::Sender<Vec<Service>>,
    ) -> Result<(), StoreError>;

    /// Deliver the full destination collection on `updates` now and after
    /// every change, until the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe_destinations(
        &self,
        updates: mpsc::Sender<Vec<Destination>>,
    ) -> Result<(), StoreError>;

    /// Insert or replace a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    async fn upsert_service(&self, service: Service) -> Result<(), StoreError>;

    /// Remove a service and every destination bound to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    async fn delete_service(&self, id: &ServiceId) -> Result<(), StoreError>;

    /// Insert or replace a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    async fn upsert_destination(&self, destination: Destination) -> Result<(), StoreError>;

    /// Remove a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    async fn delete_destination(&self, id: &DestinationId) -> Result<(), StoreError>;

    /// The election primitive backed by this store.
    fn elector(&self) -> Arc<dyn Elector>;
}
