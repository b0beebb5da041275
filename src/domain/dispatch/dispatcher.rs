use std::sync::Arc;
use std::time::Duration;

use crate::domain::dispatch::host_selector::{HostRequirements, HostSelector};
use crate::domain::model::cluster_node::{HeartbeatInfo, WorkerCandidate};
use crate::domain::model::task_instance::TaskInstance;
use crate::domain::registry::registry_client::{RegistryClient, list_json};
use crate::domain::registry::registry_path::{WORKER_PREFIX, worker_group_of};
use crate::domain::rpc::client::{ResponseFuture, RpcClient};
use crate::domain::rpc::protocol::{AckStatus, Payload, TaskExecuteRequest};
use crate::domain::utils::id::{Host, TaskInstanceId};
use crate::error::{DispatchError, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorType {
    Worker,
}

/// Everything needed to send one attempt of one task to one host.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub host: Host,
    pub executor_type: ExecutorType,
    pub command: Payload,
    pub task_instance_id: TaskInstanceId,
    pub attempt: u32,
}

impl ExecutionContext {
    pub fn for_task(task: &TaskInstance, host: Host, master_host: Host) -> Self {
        let command = Payload::TaskExecuteRequest(TaskExecuteRequest {
            task_instance_id: task.id.clone(),
            workflow_instance_id: task.workflow_instance_id.clone(),
            node_code: task.node_code.clone(),
            attempt: task.attempt,
            kind: task.kind,
            params: task.params.clone(),
            master_host,
        });
        Self { host, executor_type: ExecutorType::Worker, command, task_instance_id: task.id.clone(), attempt: task.attempt }
    }
}

/// Answer of a worker to TASK_EXECUTE_REQUEST.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAck {
    pub attempt: u32,
    pub status: AckStatus,
    pub message: Option<String>,
}

/// Master side of task delivery: reads the live workers from the registry on
/// every call, picks one through the configured selector and sends the task.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<dyn RegistryClient>,
    rpc: RpcClient,
    selector: Box<dyn HostSelector>,
    master_host: Host,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn RegistryClient>, rpc: RpcClient, selector: Box<dyn HostSelector>, master_host: Host) -> Self {
        Self { registry, rpc, selector, master_host }
    }

    pub fn master_host(&self) -> &Host {
        &self.master_host
    }

    pub async fn live_workers(&self) -> Result<Vec<WorkerCandidate>, DispatchError> {
        let entries = list_json::<HeartbeatInfo>(self.registry.as_ref(), WORKER_PREFIX).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, heartbeat)| {
                let group = worker_group_of(&path)?.to_string();
                Some(WorkerCandidate { host: heartbeat.host.clone(), group, heartbeat })
            })
            .collect())
    }

    pub async fn select_host(&self, worker_group: &str) -> Result<Host, DispatchError> {
        let candidates = self.live_workers().await?;
        let chosen = self.selector.select(&candidates, &HostRequirements::group(worker_group))?;
        Ok(chosen.host.clone())
    }

    pub fn context_for(&self, task: &TaskInstance, host: Host) -> ExecutionContext {
        ExecutionContext::for_task(task, host, self.master_host.clone())
    }

    /// Sends the execute request and returns the pending ack.
    pub async fn send(&self, context: &ExecutionContext) -> Result<ResponseFuture, DispatchError> {
        match context.executor_type {
            ExecutorType::Worker => Ok(self.rpc.send_async(&context.host, context.command.clone()).await?),
        }
    }

    /// Waits for the worker's ack of a sent request.
    pub async fn await_ack(&self, context: &ExecutionContext, ack: ResponseFuture, timeout: Duration) -> Result<DispatchAck, DispatchError> {
        match ack.wait(timeout).await? {
            Payload::TaskExecuteAck { task_instance_id, attempt, status, message, .. } if task_instance_id == context.task_instance_id => {
                Ok(DispatchAck { attempt, status, message })
            }
            _ => Err(RpcError::UnexpectedResponse { host: context.host.clone(), expected: "TASK_EXECUTE_ACK" }.into()),
        }
    }

    /// Fire-and-forget kill of one attempt.
    pub async fn send_kill(&self, host: &Host, task_instance_id: &TaskInstanceId, attempt: u32) -> Result<(), DispatchError> {
        let payload = Payload::TaskKill { task_instance_id: task_instance_id.clone(), attempt };
        Ok(self.rpc.send_oneway(host, payload).await?)
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }
}
