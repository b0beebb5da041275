use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::model::definition::{Priority, TaskDefinition, TaskKind, TimeoutPolicy};
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    /// Waiting for a worker to be assigned.
    Dispatch,
    /// Sent to a worker, not yet acknowledged.
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Killed,
    Paused,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Killed)
    }

    /// Whether a worker currently holds this task.
    pub fn is_on_worker(&self) -> bool {
        matches!(self, TaskState::Dispatched | TaskState::Running)
    }
}

/// Terminal status reported by a worker for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Failure,
    Killed,
}

/// One execution of one DAG node. Retries and re-dispatches bump `attempt`
/// on the same instance instead of creating a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub node_code: NodeCode,
    pub kind: TaskKind,
    pub state: TaskState,

    /// Id of the current dispatch attempt. Worker events carrying another
    /// attempt id are stale.
    pub attempt: u32,
    /// Attempt id that has been handed to a worker, if any.
    pub dispatched_attempt: Option<u32>,

    pub retry_times: u32,
    pub max_retry_times: u32,
    pub retry_interval: Duration,
    pub dispatch_failures: u32,
    pub retry_not_before: Option<i64>,

    pub host: Option<Host>,
    pub dispatch_time: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,

    pub priority: Priority,
    pub worker_group: String,
    pub params: BTreeMap<String, String>,
    pub timeout: Option<TimeoutPolicy>,
    pub timeout_warned: bool,
    pub resumable: bool,
}

impl TaskInstance {
    pub fn new(workflow_instance_id: WorkflowInstanceId, definition: &TaskDefinition) -> Self {
        Self {
            id: TaskInstanceId::random(),
            workflow_instance_id,
            node_code: definition.code.clone(),
            kind: definition.kind,
            state: TaskState::Created,
            attempt: 0,
            dispatched_attempt: None,
            retry_times: 0,
            max_retry_times: definition.retry_times,
            retry_interval: definition.retry_interval,
            dispatch_failures: 0,
            retry_not_before: None,
            host: None,
            dispatch_time: None,
            start_time: None,
            end_time: None,
            priority: definition.priority,
            worker_group: definition.worker_group.clone(),
            params: definition.params.clone(),
            timeout: definition.timeout,
            timeout_warned: false,
            resumable: definition.resumable,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
