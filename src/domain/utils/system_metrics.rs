use sysinfo::System;

use crate::domain::model::cluster_node::ServerStatus;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Snapshot of the host's load, as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemMetrics {
    pub cpu_load_avg: f64,
    pub available_memory_mb: u64,
}

impl SystemMetrics {
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self::from_system(&system)
    }

    /// Reads from an already refreshed `System`. Load average is zero where
    /// the platform has none.
    pub fn from_system(system: &System) -> Self {
        Self { cpu_load_avg: System::load_average().one, available_memory_mb: system.available_memory() / BYTES_PER_MB }
    }

    /// A negative cpu limit disables the cpu check.
    pub fn server_status(&self, max_cpu_load_avg: f64, reserved_memory_mb: u64) -> ServerStatus {
        let cpu_exceeded = max_cpu_load_avg >= 0.0 && self.cpu_load_avg > max_cpu_load_avg;
        let memory_exhausted = self.available_memory_mb < reserved_memory_mb;
        if cpu_exceeded || memory_exhausted { ServerStatus::Busy } else { ServerStatus::Normal }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_host_memory() {
        let mut system = System::new();
        system.refresh_memory();
        let metrics = SystemMetrics::from_system(&system);

        assert_eq!(metrics.available_memory_mb, system.available_memory() / BYTES_PER_MB);
        assert!(metrics.available_memory_mb <= system.total_memory() / BYTES_PER_MB);
        assert!(metrics.cpu_load_avg >= 0.0);
    }

    #[test]
    fn busy_when_over_limits() {
        let metrics = SystemMetrics { cpu_load_avg: 4.0, available_memory_mb: 512 };
        assert_eq!(metrics.server_status(-1.0, 0), ServerStatus::Normal);
        assert_eq!(metrics.server_status(2.0, 0), ServerStatus::Busy);
        assert_eq!(metrics.server_status(-1.0, 1024), ServerStatus::Busy);
    }
}
