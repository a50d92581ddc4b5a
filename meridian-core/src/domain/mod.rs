//! Domain models for virtual services and their destinations.

pub mod destination;
pub mod service;
pub mod snapshot;
