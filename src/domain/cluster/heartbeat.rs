use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::clock::SharedClock;
use crate::domain::model::cluster_node::{HeartbeatInfo, NodeRole, ServerStatus};
use crate::domain::registry::registry_client::{RegistryClient, put_ephemeral_json};
use crate::domain::utils::id::Host;
use crate::domain::utils::system_metrics::SystemMetrics;
use crate::error::RegistryError;

/// Produces the payload written on every beat.
pub trait HeartbeatReporter: Send + Sync {
    fn heartbeat(&self) -> HeartbeatInfo;
}

/// Heartbeat of a master, worker or alert server process.
#[derive(Debug)]
pub struct NodeHeartbeat {
    pub role: NodeRole,
    pub host: Host,
    pub startup_time: i64,
    pub exec_threads: u32,
    pub host_weight: u32,
    pub max_cpu_load_avg: f64,
    pub reserved_memory_mb: u64,
    /// Tasks accepted but not finished, shared with the owner.
    pub pending_tasks: Arc<AtomicU32>,
    pub clock: SharedClock,
}

impl NodeHeartbeat {
    pub fn new(role: NodeRole, host: Host, clock: SharedClock) -> Self {
        Self {
            role,
            host,
            startup_time: clock.now_ms(),
            exec_threads: 0,
            host_weight: 100,
            max_cpu_load_avg: -1.0,
            reserved_memory_mb: 0,
            pending_tasks: Arc::new(AtomicU32::new(0)),
            clock,
        }
    }
}

impl NodeHeartbeat {
    /// Busy when the host is overloaded or, for a worker, every execution
    /// slot is taken.
    fn server_status(&self, metrics: &SystemMetrics, pending_tasks: u32) -> ServerStatus {
        if self.exec_threads > 0 && pending_tasks >= self.exec_threads {
            return ServerStatus::Busy;
        }
        metrics.server_status(self.max_cpu_load_avg, self.reserved_memory_mb)
    }
}

impl HeartbeatReporter for NodeHeartbeat {
    fn heartbeat(&self) -> HeartbeatInfo {
        let metrics = SystemMetrics::collect();
        let pending_tasks = self.pending_tasks.load(Ordering::Relaxed);
        HeartbeatInfo {
            role: self.role,
            host: self.host.clone(),
            startup_time: self.startup_time,
            report_time: self.clock.now_ms(),
            cpu_load_avg: metrics.cpu_load_avg,
            available_memory_mb: metrics.available_memory_mb,
            exec_threads: self.exec_threads,
            host_weight: self.host_weight,
            pending_tasks,
            process_id: std::process::id(),
            server_status: self.server_status(&metrics, pending_tasks),
        }
    }
}

/// Rewrites the node's ephemeral registry entry at a fixed interval.
pub struct HeartbeatTask {
    registry: Arc<dyn RegistryClient>,
    path: String,
    reporter: Arc<dyn HeartbeatReporter>,
    interval: Duration,
}

impl HeartbeatTask {
    pub fn new(registry: Arc<dyn RegistryClient>, path: String, reporter: Arc<dyn HeartbeatReporter>, interval: Duration) -> Self {
        Self { registry, path, reporter, interval }
    }

    pub async fn beat_once(&self) -> Result<(), RegistryError> {
        put_ephemeral_json(self.registry.as_ref(), &self.path, &self.reporter.heartbeat()).await
    }

    /// Beats immediately, then every interval until cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat_once().await {
                            log::warn!("Heartbeat to {} failed: {}", self.path, e);
                            if matches!(e, RegistryError::SessionExpired(_)) {
                                break;
                            }
                        }
                    }
                }
            }
            log::debug!("Heartbeat {} stopped", self.path);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::MockClock;
    use crate::domain::registry::memory_registry::{MemoryCoordinator, MemoryRegistry};
    use crate::domain::registry::registry_client::get_json;

    #[tokio::test]
    async fn beat_writes_fresh_heartbeat() {
        let coordinator = MemoryCoordinator::new(Duration::from_secs(5));
        let registry: Arc<dyn RegistryClient> = Arc::new(MemoryRegistry::connect(&coordinator));
        let clock = MockClock::new(1_000);

        let reporter = Arc::new(NodeHeartbeat { exec_threads: 4, ..NodeHeartbeat::new(NodeRole::Worker, Host::new("w1:1"), clock.shared()) });
        reporter.pending_tasks.store(3, Ordering::Relaxed);
        let task = HeartbeatTask::new(registry.clone(), "/nodes/worker/default/w1:1".into(), reporter, Duration::from_secs(1));

        task.beat_once().await.unwrap();
        clock.advance(Duration::from_secs(2));
        task.beat_once().await.unwrap();

        let info: HeartbeatInfo = get_json(registry.as_ref(), "/nodes/worker/default/w1:1").await.unwrap().unwrap();
        assert_eq!(info.startup_time, 1_000);
        assert_eq!(info.report_time, 3_000);
        assert_eq!(info.pending_tasks, 3);
        assert_eq!(info.exec_threads, 4);
    }

    #[test]
    fn worker_without_free_slot_reports_busy() {
        let clock = MockClock::new(0);
        let reporter = NodeHeartbeat { exec_threads: 2, ..NodeHeartbeat::new(NodeRole::Worker, Host::new("w1:1"), clock.shared()) };

        reporter.pending_tasks.store(1, Ordering::Relaxed);
        assert_eq!(reporter.heartbeat().server_status, ServerStatus::Normal);

        reporter.pending_tasks.store(2, Ordering::Relaxed);
        assert_eq!(reporter.heartbeat().server_status, ServerStatus::Busy);

        // Masters have no execution slots.
        let master = NodeHeartbeat::new(NodeRole::Master, Host::new("m1:1"), clock.shared());
        master.pending_tasks.store(5, Ordering::Relaxed);
        assert_eq!(master.heartbeat().server_status, ServerStatus::Normal);
    }
}
