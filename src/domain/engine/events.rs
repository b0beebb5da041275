use tokio::sync::oneshot;

use crate::domain::dag::dag_engine::DagSummary;
use crate::domain::model::task_instance::TaskInstance;
use crate::domain::model::workflow_instance::{WorkflowInstance, WorkflowState};
use crate::domain::rpc::protocol::{AckStatus, TaskExecuteResult};
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId};
use crate::error::EngineError;

pub type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Everything a workflow runnable reacts to. Events are applied one at a
/// time in arrival order.
#[derive(Debug)]
pub enum WorkflowEvent {
    Start,
    TaskAck { task_instance_id: TaskInstanceId, attempt: u32, status: AckStatus },
    TaskResult(TaskExecuteResult),
    DispatchFailed { task_instance_id: TaskInstanceId, attempt: u32, reason: String },
    Tick,
    Pause(Reply<WorkflowState>),
    Resume(Reply<WorkflowState>),
    Stop(Reply<WorkflowState>),
    KillTask { node: NodeCode, reply: Reply<()> },
    /// Returns the number of tasks that were failed over.
    WorkerLost { host: Host, reply: Option<oneshot::Sender<usize>> },
    Snapshot(oneshot::Sender<WorkflowSnapshot>),
}

#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowInstance,
    pub tasks: Vec<TaskInstance>,
    pub summary: DagSummary,
}

impl WorkflowSnapshot {
    pub fn task(&self, node: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.node_code.as_str() == node)
    }
}
