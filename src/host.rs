//! Host capability queries used while validating machine configuration.

use sysinfo::System;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// Total physical memory reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMemory {
    total_mib: u64,
}

impl HostMemory {
    /// Queries the operating system for total physical memory.
    pub fn query() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let total_mib = system.total_memory() / MIB;
        debug!(total_mib, "host memory queried");
        Self { total_mib }
    }

    /// A fixed amount, for callers that already know the host size.
    pub fn from_total_mib(total_mib: u64) -> Self {
        Self { total_mib }
    }

    pub fn total_mib(&self) -> u64 {
        self.total_mib
    }

    /// `true` when `requested_mib` fits in host memory.
    pub fn admits(&self, requested_mib: u64) -> bool {
        requested_mib <= self.total_mib
    }
}
