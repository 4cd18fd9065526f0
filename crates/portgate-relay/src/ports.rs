//! Public port allocation
//!
//! Ports are drawn from a fixed set of inclusive ranges. Allocation tries
//! the caller's preferred port first, then a handful of random draws, then
//! a full linear scan before declaring the ranges exhausted. The allocator
//! itself holds no assignment state; callers supply an `is_assigned` check
//! backed by the registry so that reservation stays atomic with lookup.

use rand::Rng;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Random draws attempted before falling back to a linear scan.
const RANDOM_DRAW_ATTEMPTS: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port in every range is currently assigned
    #[error("no public port available")]
    Exhausted,

    /// The preferred port does not fall inside any allowed range
    #[error("port {0} is outside the allowed ranges")]
    OutOfRange(u16),
}

/// Draws unassigned ports from the configured ranges.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortAllocator {
    pub fn new(ranges: Vec<RangeInclusive<u16>>) -> Self {
        Self { ranges }
    }

    /// Whether `port` falls inside one of the allowed ranges.
    pub fn in_range(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }

    /// Total number of assignable ports.
    pub fn capacity(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| (*r.end() as usize) - (*r.start() as usize) + 1)
            .sum()
    }

    /// Pick an unassigned port.
    ///
    /// A preferred port outside the ranges is an error; a preferred port
    /// that is merely taken falls back to the normal draw. The linear scan
    /// guarantees that allocation only fails when the ranges are truly
    /// full.
    pub fn allocate(
        &self,
        preferred: Option<u16>,
        mut is_assigned: impl FnMut(u16) -> bool,
    ) -> Result<u16, PortError> {
        if let Some(port) = preferred {
            if !self.in_range(port) {
                return Err(PortError::OutOfRange(port));
            }
            if !is_assigned(port) {
                return Ok(port);
            }
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_DRAW_ATTEMPTS {
            let range = &self.ranges[rng.gen_range(0..self.ranges.len())];
            let port = rng.gen_range(*range.start()..=*range.end());
            if !is_assigned(port) {
                return Ok(port);
            }
        }

        for range in &self.ranges {
            for port in range.clone() {
                if !is_assigned(port) {
                    return Ok(port);
                }
            }
        }

        Err(PortError::Exhausted)
    }
}
