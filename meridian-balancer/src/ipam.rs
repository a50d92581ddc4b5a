//! Virtual address allocation from configured ranges.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use meridian_core::State;

use crate::error::AllocatorError;

/// Hands out service addresses not yet used by any known service.
#[derive(Debug)]
pub struct Allocator {
    state: Arc<State>,
    ranges: Vec<IpNet>,
}

impl Allocator {
    /// Bind an allocator to `state` and `ranges`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Overlap`] if two ranges share addresses.
    pub fn new(state: Arc<State>, ranges: Vec<IpNet>) -> Result<Self, AllocatorError> {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.contains(b) || b.contains(a) {
                    return Err(AllocatorError::Overlap(*a, *b));
                }
            }
        }
        Ok(Self { state, ranges })
    }

    /// The configured ranges.
    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    /// The first free host address, searching the ranges in order.
    ///
    /// The address is not reserved: it stays free until a service using it
    /// reaches state.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Exhausted`] when every host address is
    /// taken.
    pub fn allocate(&self) -> Result<IpAddr, AllocatorError> {
        let used: HashSet<IpAddr> = self
            .state
            .get_services()
            .into_iter()
            .map(|s| s.address)
            .collect();

        self.ranges
            .iter()
            .flat_map(IpNet::hosts)
            .find(|addr| !used.contains(addr))
            .ok_or(AllocatorError::Exhausted {
                ranges: self.ranges.len(),
            })
    }
}
