//! Meridian balancer engine.
//!
//! Builds a [`Balancer`] from a [`BalancerConfig`]: the state replicated
//! from the store, the backend syncers that program this host, the leader
//! election watcher and the reconcile loop that ties them together.

pub mod balancer;
pub mod config;
pub mod election;
pub mod error;
pub mod health_check;
pub mod ipam;
pub mod metrics;
pub mod net;
pub mod reconcile;
pub mod syncers;

pub use balancer::{Balancer, Components, SystemComponents};
pub use config::{BalancerConfig, ClusterMode, ConfigLoader};
pub use error::{
    AllocatorError, BalancerError, CommandError, ConfigError, NetError, ReconcileError,
};
pub use ipam::Allocator;
pub use net::NetOps;
pub use reconcile::{Gate, PassReport, Pipeline, ReconcileStats, Stage, StatsSnapshot};
