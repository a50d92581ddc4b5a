//! Meridian Core functionality.
//!
//! This crate contains the domain models, the replicated state cache, and the
//! collaborator contracts (store, election, syncers, health) that the Meridian
//! balancer reconciles against.

pub mod domain;
pub mod error;
pub mod health;
pub mod leadership;
pub mod signal;
pub mod state;
pub mod store;
pub mod sync;

pub use domain::destination::{Destination, DestinationId, ForwardingMode};
pub use domain::service::{Protocol, Scheduler, Service, ServiceId};
pub use domain::snapshot::StateSnapshot;
pub use error::{StateError, StoreError, SyncError};
pub use health::{HealthMonitor, HealthStatus, HealthTable};
pub use leadership::{ElectionEvents, Elector, Leadership};
pub use signal::{change_channel, Change, ChangeReceiver, ChangeSender};
pub use state::State;
pub use store::Store;
pub use sync::{RoutingSyncer, Syncer};
