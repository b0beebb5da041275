use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::alert::alert_client::{AlertClient, AlertNotifier};
use crate::domain::clock::SharedClock;
use crate::domain::cluster::failover::{FailoverDetector, FailoverHandler};
use crate::domain::cluster::heartbeat::{HeartbeatTask, NodeHeartbeat};
use crate::domain::config::ClusterConfig;
use crate::domain::dispatch::dispatcher::Dispatcher;
use crate::domain::engine::workflow_engine::WorkflowEngine;
use crate::domain::engine::workflow_runnable::EngineContext;
use crate::domain::master::failover_handlers::{MasterFailoverHandler, WorkerFailoverHandler};
use crate::domain::master::processors::{TaskResultProcessor, WorkerFailoverProcessor};
use crate::domain::model::cluster_node::NodeRole;
use crate::domain::registry::registry_client::RegistryClient;
use crate::domain::registry::registry_path::{MASTER_PREFIX, failover_lock_path, host_of, master_path};
use crate::domain::rpc::client::RpcClient;
use crate::domain::rpc::server::RpcServer;
use crate::domain::store::metadata_store::MetadataStore;
use crate::domain::utils::id::Host;
use crate::domain::utils::statistics::StatsCollector;
use crate::error::Result;

/// A master process: owns workflow instances, dispatches their tasks,
/// receives results and takes part in failover of dead nodes.
pub struct MasterServer {
    engine: Arc<WorkflowEngine>,
    rpc_server: RpcServer,
    rpc: RpcClient,
    registry: Arc<dyn RegistryClient>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl MasterServer {
    /// Binds `bind_ip:master.listen_port`, registers in the registry and
    /// adopts workflows orphaned by masters that died before it started.
    pub async fn start(
        config: &ClusterConfig,
        bind_ip: &str,
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn MetadataStore>,
        clock: SharedClock,
        stats: StatsCollector,
    ) -> Result<Self> {
        let mut rpc_server = RpcServer::bind(&format!("{}:{}", bind_ip, config.master.listen_port), config.rpc.serializer.build()).await?;
        let host = rpc_server.local_host().clone();
        let rpc = RpcClient::new(&config.rpc);

        let dispatcher = Dispatcher::new(registry.clone(), rpc.clone(), config.master.host_selector.get_instance(), host.clone());
        let alert: Option<Arc<dyn AlertNotifier>> = config
            .alert
            .enabled
            .then(|| Arc::new(AlertClient::new(registry.clone(), rpc.clone(), config.alert.send_timeout)) as Arc<dyn AlertNotifier>);

        let shutdown = CancellationToken::new();
        let engine = Arc::new(WorkflowEngine::new(EngineContext {
            store: store.clone(),
            dispatcher: Arc::new(dispatcher),
            clock: clock.clone(),
            config: config.master.clone(),
            stats,
            alert,
            shutdown: shutdown.child_token(),
        }));

        rpc_server.register_processor(Arc::new(TaskResultProcessor { engine: engine.clone(), store: store.clone() }));
        rpc_server.register_processor(Arc::new(WorkerFailoverProcessor { engine: engine.clone() }));
        rpc_server.start();

        let reporter = NodeHeartbeat {
            max_cpu_load_avg: config.master.max_cpu_load_avg,
            reserved_memory_mb: config.master.reserved_memory_mb,
            ..NodeHeartbeat::new(NodeRole::Master, host.clone(), clock)
        };
        let heartbeat = HeartbeatTask::new(registry.clone(), master_path(&host), Arc::new(reporter), config.master.heartbeat_interval);
        heartbeat.beat_once().await?;
        let mut background = vec![heartbeat.start(shutdown.clone())];

        let master_failover = Arc::new(MasterFailoverHandler { engine: engine.clone(), store: store.clone(), rpc: rpc.clone() });
        let worker_failover =
            Arc::new(WorkerFailoverHandler { engine: engine.clone(), store: store.clone(), registry: registry.clone(), rpc: rpc.clone() });

        let server = Self { engine, rpc_server, rpc, registry: registry.clone(), shutdown: shutdown.clone(), background: Vec::new() };
        server.recover_orphans(&master_failover, &store).await?;

        let handlers: Vec<Arc<dyn FailoverHandler>> = vec![worker_failover, master_failover];
        let detector = Arc::new(FailoverDetector::new(registry, handlers));
        background.push(detector.start(config.master.failover_interval, shutdown));

        log::info!("Master started on {}", host);
        Ok(Self { background, ..server })
    }

    /// Takes over active workflows whose owner is not a registered master,
    /// including this host's own instances from a previous run.
    async fn recover_orphans(&self, handler: &MasterFailoverHandler, store: &Arc<dyn MetadataStore>) -> Result<()> {
        let alive: HashSet<Host> = self.registry.list(MASTER_PREFIX).await?.into_iter().map(|(path, _)| host_of(&path)).collect();
        let me = self.host();
        let orphaned: BTreeSet<Host> =
            store.list_active_workflows().into_iter().map(|w| w.host).filter(|owner| owner == me || !alive.contains(owner)).collect();

        for owner in orphaned {
            let lock = failover_lock_path(NodeRole::Master, &owner);
            if !self.registry.try_acquire_lock(&lock).await? {
                log::info!("Orphans of {} are recovered by another master", owner);
                continue;
            }
            let recovered = handler.take_over_host(&owner).await;
            self.registry.release_lock(&lock).await?;
            log::info!("Recovered {} orphaned workflows of {}", recovered?, owner);
        }
        Ok(())
    }

    pub fn host(&self) -> &Host {
        self.rpc_server.local_host()
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Leaves the cluster. Running workflows are detached, not finished, so
    /// that another master picks them up.
    pub async fn shutdown(mut self) {
        self.engine.shutdown();
        self.shutdown.cancel();
        for task in self.background.drain(..) {
            let _ = task.await;
        }
        self.rpc_server.shutdown().await;
        self.rpc.close();
        self.registry.close().await;
        log::info!("Master {} stopped", self.host());
    }
}
