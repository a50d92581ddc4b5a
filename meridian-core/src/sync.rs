//! Backend syncer contracts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::snapshot::StateSnapshot;
use crate::error::SyncError;

/// A backend that can be reconciled to match a state snapshot.
///
/// `sync` must be idempotent and must converge the backend's live
/// configuration to exactly `state`, removing what is no longer wanted.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Reconcile the backend with `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be brought in line.
    async fn sync(&self, state: &StateSnapshot) -> Result<(), SyncError>;
}

/// An anycast route advertiser: a [`Syncer`] that also runs a long-lived
/// speaker.
#[async_trait]
pub trait RoutingSyncer: Syncer {
    /// Run the route speaker until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the speaker cannot be started or dies.
    async fn serve(&self, cancel: CancellationToken) -> Result<(), SyncError>;
}
