//! Owned, point-in-time copies of the replicated state.

use std::collections::HashMap;

use crate::domain::destination::{Destination, DestinationId};
use crate::domain::service::{Service, ServiceId};
use crate::error::StateError;

/// Services keyed by identifier.
pub type Services = HashMap<ServiceId, Service>;

/// Destinations keyed by identifier.
pub type Destinations = HashMap<DestinationId, Destination>;

/// An independent copy of the services and destinations known at one
/// instant.
///
/// A snapshot shares no storage with the [`State`](crate::state::State) it
/// was taken from; syncers read it without holding any lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub(crate) services: Services,
    pub(crate) destinations: Destinations,
}

impl StateSnapshot {
    /// Build a snapshot from already-keyed maps.
    pub fn new(services: Services, destinations: Destinations) -> Self {
        Self {
            services,
            destinations,
        }
    }

    /// Build a snapshot from plain collections, keying each element by its id.
    pub fn from_parts(
        services: impl IntoIterator<Item = Service>,
        destinations: impl IntoIterator<Item = Destination>,
    ) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.id(), s)).collect(),
            destinations: destinations.into_iter().map(|d| (d.id(), d)).collect(),
        }
    }

    /// All services, in unspecified order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Look up one service.
    pub fn service(&self, id: &ServiceId) -> Result<&Service, StateError> {
        self.services
            .get(id)
            .ok_or_else(|| StateError::ServiceNotFound(id.clone()))
    }

    /// All destinations bound to `service`.
    pub fn destinations_of<'a>(
        &'a self,
        service: &Service,
    ) -> impl Iterator<Item = &'a Destination> + 'a {
        let id = service.id();
        self.destinations
            .values()
            .filter(move |d| d.service_id == id)
    }

    /// Look up one destination.
    pub fn destination(&self, id: &DestinationId) -> Result<&Destination, StateError> {
        self.destinations
            .get(id)
            .ok_or_else(|| StateError::DestinationNotFound(id.clone()))
    }

    /// All destinations, including ones whose service is unknown.
    pub fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.values()
    }

    /// Every known service paired with its destinations.
    ///
    /// Destinations that reference a missing service never appear.
    pub fn pools(&self) -> impl Iterator<Item = (&Service, Vec<&Destination>)> {
        self.services
            .values()
            .map(move |svc| (svc, self.destinations_of(svc).collect()))
    }

    /// Number of services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of destinations.
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Drop every destination for which `keep` returns false. Services are
    /// left untouched.
    pub fn retain_destinations(&mut self, mut keep: impl FnMut(&Destination) -> bool) {
        self.destinations.retain(|_, d| keep(d));
    }
}
