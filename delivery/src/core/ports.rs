//! Port allocation for local deployments.

use std::collections::HashSet;

/// Hands out ports from a counter that only moves forward.
///
/// The counter starts at the lower bound and skips ports that are still
/// reserved. After `u16::MAX` it wraps back to the lower bound once; when a
/// full lap finds nothing free the pool is exhausted.
#[derive(Debug, Clone)]
pub struct PortPool {
    lower: u16,
    next: u16,
}

impl PortPool {
    pub fn new(lower: u16) -> Self {
        Self { lower, next: lower }
    }

    pub fn lower_bound(&self) -> u16 {
        self.lower
    }

    /// Next port not in `in_use`, or `None` if every port at or above the
    /// lower bound is taken.
    pub fn allocate(&mut self, in_use: &HashSet<u16>) -> Option<u16> {
        let span = usize::from(u16::MAX - self.lower) + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if candidate == u16::MAX {
                self.lower
            } else {
                candidate + 1
            };
            if !in_use.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Start again from the lower bound.
    pub fn reset(&mut self) {
        self.next = self.lower;
    }
}
