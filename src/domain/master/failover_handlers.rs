use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::cluster::failover::FailoverHandler;
use crate::domain::engine::workflow_engine::WorkflowEngine;
use crate::domain::model::cluster_node::{HeartbeatInfo, NodeRole};
use crate::domain::registry::registry_client::RegistryClient;
use crate::domain::registry::registry_path::{MASTER_PREFIX, host_of};
use crate::domain::rpc::client::RpcClient;
use crate::domain::rpc::protocol::Payload;
use crate::domain::store::metadata_store::MetadataStore;
use crate::domain::utils::id::{Host, WorkflowInstanceId};
use crate::error::{Error, RpcError};

async fn live_masters(registry: &dyn RegistryClient) -> Result<HashSet<Host>, Error> {
    Ok(registry.list(MASTER_PREFIX).await?.into_iter().map(|(path, _)| host_of(&path)).collect())
}

/// Fails over the tasks a dead worker held. Workflows of this master are
/// handled locally, the owners of the others are told via WORKER_FAILOVER.
pub struct WorkerFailoverHandler {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<dyn MetadataStore>,
    pub registry: Arc<dyn RegistryClient>,
    pub rpc: RpcClient,
}

#[async_trait]
impl FailoverHandler for WorkerFailoverHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Worker
    }

    async fn handle(&self, dead: &HeartbeatInfo) -> Result<(), Error> {
        let local = self.engine.failover_worker(&dead.host).await;
        log::info!("Worker {} lost, {} local tasks failed over", dead.host, local);

        let me = self.engine.master_host();
        let owners: BTreeSet<Host> = self
            .store
            .list_active_tasks_by_worker(&dead.host)
            .iter()
            .filter_map(|task| self.store.get_workflow(&task.workflow_instance_id).ok())
            .map(|workflow| workflow.host)
            .filter(|owner| owner != me)
            .collect();
        if owners.is_empty() {
            return Ok(());
        }

        let alive = live_masters(self.registry.as_ref()).await?;
        for owner in owners {
            if !alive.contains(&owner) {
                // Its workflows are taken over together with the dead worker's tasks.
                continue;
            }
            let request = Payload::WorkerFailover { worker: dead.host.clone() };
            match self.rpc.send_sync(&owner, request, self.rpc.request_timeout()).await? {
                Payload::WorkerFailoverAck { affected_tasks, .. } => {
                    log::info!("Master {} failed over {} tasks of worker {}", owner, affected_tasks, dead.host);
                }
                _ => return Err(RpcError::UnexpectedResponse { host: owner, expected: "WORKER_FAILOVER_ACK" }.into()),
            }
        }
        Ok(())
    }
}

/// Adopts the unfinished workflows of a dead master and points the workers
/// still running their tasks at this master.
pub struct MasterFailoverHandler {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<dyn MetadataStore>,
    pub rpc: RpcClient,
}

impl MasterFailoverHandler {
    pub async fn take_over_host(&self, dead: &Host) -> Result<usize, Error> {
        let workflows = self.store.list_active_workflows_by_host(dead);
        let mut workers: BTreeMap<Host, Vec<WorkflowInstanceId>> = BTreeMap::new();

        for workflow in &workflows {
            self.engine.take_over(&workflow.id).await?;
            for task in self.store.list_tasks_by_workflow(&workflow.id) {
                if let (true, Some(host)) = (task.state.is_on_worker(), task.host) {
                    workers.entry(host).or_default().push(workflow.id.clone());
                }
            }
        }

        let master_host = self.engine.master_host().clone();
        for (worker, ids) in workers {
            for workflow_instance_id in ids {
                let update = Payload::UpdateWorkflowHost { workflow_instance_id, master_host: master_host.clone() };
                if let Err(e) = self.rpc.send_oneway(&worker, update).await {
                    log::warn!("Worker {} not told about the new master: {}", worker, e);
                }
            }
        }
        Ok(workflows.len())
    }
}

#[async_trait]
impl FailoverHandler for MasterFailoverHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Master
    }

    async fn handle(&self, dead: &HeartbeatInfo) -> Result<(), Error> {
        let count = self.take_over_host(&dead.host).await?;
        log::info!("Master {} lost, took over {} workflows", dead.host, count);
        Ok(())
    }
}
