#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dist_workflow_scheduler::domain::clock::{SharedClock, SystemClock};
use dist_workflow_scheduler::domain::config::ClusterConfig;
use dist_workflow_scheduler::domain::dispatch::host_selector::HostSelectorType;
use dist_workflow_scheduler::domain::engine::events::WorkflowSnapshot;
use dist_workflow_scheduler::domain::master::master_server::MasterServer;
use dist_workflow_scheduler::domain::model::definition::{TaskDefinition, TaskKind};
use dist_workflow_scheduler::domain::model::task_instance::TaskState;
use dist_workflow_scheduler::domain::registry::memory_registry::{MemoryCoordinator, MemoryRegistry};
use dist_workflow_scheduler::domain::registry::registry_client::RegistryClient;
use dist_workflow_scheduler::domain::store::memory_store::MemoryMetadataStore;
use dist_workflow_scheduler::domain::store::metadata_store::MetadataStore;
use dist_workflow_scheduler::domain::utils::id::WorkflowInstanceId;
use dist_workflow_scheduler::domain::utils::statistics::StatsCollector;
use dist_workflow_scheduler::domain::worker::plugin_registry::TaskPluginRegistry;
use dist_workflow_scheduler::domain::worker::worker_server::WorkerServer;
use tokio_util::sync::CancellationToken;

pub const LOCALHOST: &str = "127.0.0.1";

/// Short timings so that timeouts, retries and failover happen within a
/// test run.
pub fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();

    config.rpc.connect_timeout = Duration::from_millis(500);
    config.rpc.request_timeout = Duration::from_secs(1);

    config.registry.session_timeout = Duration::from_millis(600);
    config.registry.reaper_interval = Duration::from_millis(50);

    config.master.listen_port = 0;
    config.master.host_selector = HostSelectorType::RoundRobin;
    config.master.dispatch_ack_timeout = Duration::from_millis(300);
    config.master.max_dispatch_retries = 2;
    config.master.dispatch_backoff_base = Duration::from_millis(50);
    config.master.dispatch_backoff_max = Duration::from_millis(200);
    config.master.state_check_interval = Duration::from_millis(20);
    config.master.heartbeat_interval = Duration::from_millis(100);
    config.master.failover_interval = Duration::from_millis(100);

    config.worker.listen_port = 0;
    config.worker.exec_threads = 4;
    config.worker.heartbeat_interval = Duration::from_millis(100);
    config.worker.result_retry_interval = Duration::from_millis(50);
    config.worker.max_result_retries = 100;

    config.alert.enabled = false;
    config
}

/// In-process cluster on one coordination service and one store.
pub struct TestCluster {
    pub config: ClusterConfig,
    pub coordinator: MemoryCoordinator,
    pub store: Arc<dyn MetadataStore>,
    pub clock: SharedClock,
    reaper: CancellationToken,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClusterConfig) -> Self {
        let coordinator = MemoryCoordinator::new(config.registry.session_timeout);
        let reaper = CancellationToken::new();
        coordinator.start_reaper(config.registry.reaper_interval, reaper.clone());
        Self { config, coordinator, store: MemoryMetadataStore::shared(), clock: SystemClock::shared(), reaper }
    }

    pub fn session(&self) -> Arc<dyn RegistryClient> {
        Arc::new(MemoryRegistry::connect(&self.coordinator))
    }

    pub async fn start_master(&self) -> MasterServer {
        MasterServer::start(&self.config, LOCALHOST, self.session(), self.store.clone(), self.clock.clone(), StatsCollector::disabled())
            .await
            .expect("master starts")
    }

    pub async fn start_worker(&self) -> WorkerServer {
        WorkerServer::start(&self.config, LOCALHOST, self.session(), self.clock.clone(), Arc::new(TaskPluginRegistry::with_defaults()))
            .await
            .expect("worker starts")
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

pub fn noop(code: &str) -> TaskDefinition {
    TaskDefinition::new(code, TaskKind::Noop)
}

pub fn sleep(code: &str, millis: u64) -> TaskDefinition {
    TaskDefinition::new(code, TaskKind::Sleep).with_param("duration_ms", &millis.to_string())
}

pub fn failing(code: &str) -> TaskDefinition {
    sleep(code, 10).with_param("fail", "true")
}

pub fn params() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Polls `check` until it returns `Some` or `timeout` elapses.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Waits until the task of `node` reaches `state` in the master's view.
pub async fn wait_for_task(master: &MasterServer, id: &WorkflowInstanceId, node: &str, state: TaskState) -> WorkflowSnapshot {
    eventually(Duration::from_secs(10), || async move {
        let snapshot = master.engine().snapshot(id).await.ok()?;
        (snapshot.task(node)?.state == state).then_some(snapshot)
    })
    .await
    .unwrap_or_else(|| panic!("task {} never reached {:?}", node, state))
}
