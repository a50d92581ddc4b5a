//! Balancer error types.

use std::path::PathBuf;

use ipnet::IpNet;
use meridian_core::{StoreError, SyncError};
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file '{path}': {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML content.
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid field value.
    #[error("invalid value for field '{field}': {message}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Error message.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A host command that could not be run or exited unsuccessfully.
#[derive(Debug, Clone, Error)]
#[error("command `{command}` failed: {reason}")]
pub struct CommandError {
    /// The command line.
    pub command: String,
    /// Captured stderr, exit status or spawn error.
    pub reason: String,
}

impl From<CommandError> for SyncError {
    fn from(err: CommandError) -> Self {
        SyncError::Command {
            command: err.command,
            reason: err.reason,
        }
    }
}

/// Network-interface operation failures.
#[derive(Debug, Error)]
pub enum NetError {
    /// The underlying command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A tool printed something we could not parse.
    #[error("unexpected output from `{command}`: {line}")]
    UnexpectedOutput {
        /// The command that produced it.
        command: String,
        /// The offending line.
        line: String,
    },
}

impl From<NetError> for SyncError {
    fn from(err: NetError) -> Self {
        SyncError::Interface(err.to_string())
    }
}

/// Address allocation failures.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Every address in every range is taken.
    #[error("no free address left in {ranges} configured range(s)")]
    Exhausted {
        /// How many ranges were searched.
        ranges: usize,
    },

    /// Two configured ranges overlap.
    #[error("address ranges {0} and {1} overlap")]
    Overlap(IpNet, IpNet),
}

/// A reconcile pass that stopped at a failing stage.
#[derive(Debug, Error)]
#[error("[{stage}] {source}")]
pub struct ReconcileError {
    /// Name of the stage that failed.
    pub stage: &'static str,
    /// What the stage's syncer reported.
    #[source]
    pub source: SyncError,
}

/// Errors that stop the balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// The store could not be opened or subscribed to.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// A backend syncer could not be constructed.
    #[error("failed to construct {component} syncer: {source}")]
    Construct {
        /// Which component failed.
        component: &'static str,
        /// Why.
        #[source]
        source: SyncError,
    },

    /// The address allocator could not be built.
    #[error("address allocator: {0}")]
    Allocator(#[from] AllocatorError),

    /// Left-over VIPs could not be removed at start-up.
    #[error("error cleaning up network vips: {0}")]
    Cleanup(#[source] NetError),

    /// This instance won the election but could not claim its VIPs.
    #[error("elected leader but could not sync vips: {0}")]
    LeadershipFatal(#[source] SyncError),

    /// Invalid configuration.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl BalancerError {
    /// Wrap a syncer construction failure with its component name.
    pub fn construct(component: &'static str) -> impl FnOnce(SyncError) -> Self {
        move |source| Self::Construct { component, source }
    }
}
