//! Meridian Store
//!
//! The store collaborator shipped with the balancer: an in-process key-value
//! store for services and destinations with full-collection change feeds, and
//! the leader-election primitive built on it.

pub mod election;
pub mod memory;

pub use election::MemoryElector;
pub use memory::{MemoryStore, SeedData};
