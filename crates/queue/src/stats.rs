//! Point-in-time pool statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Snapshot of a pool's counters, taken under the pool lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    /// Jobs waiting to start.
    pub pending: usize,
    /// Jobs currently running.
    pub in_flight: usize,
    /// Jobs started since the pool was created.
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub draining: bool,
    pub done: bool,
}

impl PoolStats {
    /// Jobs that have settled, either way.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats {{ name: {}, capacity: {}, pending: {}, in_flight: {}, succeeded: {}, failed: {}, done: {} }}",
            self.name,
            self.capacity,
            self.pending,
            self.in_flight,
            self.succeeded,
            self.failed,
            self.done
        )
    }
}
