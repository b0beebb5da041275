use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::engine::workflow_engine::WorkflowEngine;
use crate::domain::rpc::processor::{CommandProcessor, RequestContext};
use crate::domain::rpc::protocol::{CommandType, Payload};
use crate::domain::store::metadata_store::MetadataStore;

/// Receives terminal task reports from workers.
///
/// The report is acknowledged once it reached the owning runnable, or when
/// no one will ever need it (workflow unknown or finished). Otherwise the
/// worker gets an error and keeps retrying.
pub struct TaskResultProcessor {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<dyn MetadataStore>,
}

#[async_trait]
impl CommandProcessor for TaskResultProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskExecuteResult
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::TaskExecuteResult(result) = payload else {
            return Some(Payload::error("expected TASK_EXECUTE_RESULT"));
        };
        let ack = Payload::TaskExecuteResultAck { task_instance_id: result.task_instance_id.clone(), attempt: result.attempt };
        let workflow_id = result.workflow_instance_id.clone();

        if self.engine.on_task_result(result) {
            return Some(ack);
        }
        match self.store.get_workflow(&workflow_id) {
            Ok(workflow) if !workflow.is_terminal() => {
                log::warn!("Result for workflow {} owned by {} arrived at {}", workflow_id, workflow.host, self.engine.master_host());
                Some(Payload::error(format!("workflow {} is owned by {}", workflow_id, workflow.host)))
            }
            Ok(_) | Err(_) => {
                log::debug!("Dropping result for finished or unknown workflow {}", workflow_id);
                Some(ack)
            }
        }
    }
}

/// Worker loss reported by the master that handled the worker's failover.
pub struct WorkerFailoverProcessor {
    pub engine: Arc<WorkflowEngine>,
}

#[async_trait]
impl CommandProcessor for WorkerFailoverProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::WorkerFailover
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::WorkerFailover { worker } = payload else {
            return Some(Payload::error("expected WORKER_FAILOVER"));
        };
        let affected = self.engine.failover_worker(&worker).await;
        Some(Payload::WorkerFailoverAck { worker, affected_tasks: affected as u32 })
    }
}
