//! Error types shared by the core and its collaborators.

use std::time::Duration;

use thiserror::Error;

use crate::domain::destination::DestinationId;
use crate::domain::service::ServiceId;

/// Lookup failures against the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// No service with this identifier is known.
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    /// No destination with this identifier is known.
    #[error("destination not found: {0}")]
    DestinationNotFound(DestinationId),
}

/// Failures reported by a store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or opened.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A subscription could not be established or was closed.
    #[error("subscription to {collection} failed: {reason}")]
    Subscription {
        /// Which collection feed failed.
        collection: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// The election primitive rejected a request.
    #[error("election on '{key}' failed: {reason}")]
    Election {
        /// The election key.
        key: String,
        /// Why it failed.
        reason: String,
    },

    /// Seed data could not be loaded.
    #[error("invalid seed data: {0}")]
    Seed(String),
}

/// Failures reported by a backend syncer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A host command exited unsuccessfully.
    #[error("command `{command}` failed: {reason}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Captured stderr or spawn error.
        reason: String,
    },

    /// A network-interface operation failed.
    #[error("interface operation failed: {0}")]
    Interface(String),

    /// The sync did not finish within its deadline.
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}
