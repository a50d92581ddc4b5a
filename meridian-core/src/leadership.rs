//! Leadership state and the election primitive contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// This instance's standing in the cluster election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Leadership {
    /// Running for election, no outcome observed yet.
    #[default]
    Pending,
    /// This instance holds the lease.
    Leader,
    /// Another instance holds the lease, or ours was lost.
    Follower,
}

impl Leadership {
    /// Whether this instance currently leads.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl fmt::Display for Leadership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Leader => "leader",
            Self::Follower => "follower",
        };
        f.write_str(name)
    }
}

/// Stream of election outcomes for one candidacy.
///
/// Only [`Leadership::Leader`] and [`Leadership::Follower`] are delivered.
/// The stream is unbounded: a transition is never dropped while the
/// consumer is busy with the previous one.
pub type ElectionEvents = mpsc::UnboundedReceiver<Leadership>;

/// A leader-election primitive built on the store.
///
/// Lease and session renewal are the implementation's business; callers
/// only consume transitions.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Register `candidate` under `key` and start running for election.
    ///
    /// # Errors
    ///
    /// Returns an error if the candidacy cannot be registered.
    async fn campaign(
        &self,
        key: &str,
        candidate: &str,
        lease: Duration,
    ) -> Result<ElectionEvents, StoreError>;

    /// Give up the candidacy, releasing the lease if held.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the resignation.
    async fn resign(&self, key: &str, candidate: &str) -> Result<(), StoreError>;
}
