//! Host resource probes feeding lot sizing and health

use parking_lot::Mutex;
use sysinfo::System;

/// Source of host memory pressure
pub trait SystemProbe: Send + Sync {
    /// Used fraction of memory in [0, 1], `None` when unknown
    fn memory_usage_ratio(&self) -> Option<f64>;
}

/// Reads host memory through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_usage_ratio(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some((system.used_memory() as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Probe reporting a fixed value
pub struct StaticProbe(pub Option<f64>);

impl SystemProbe for StaticProbe {
    fn memory_usage_ratio(&self) -> Option<f64> {
        self.0
    }
}
