use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::model::definition::{FailureStrategy, Priority, WorkflowDefinition};
use crate::domain::utils::id::{Host, NodeCode, WorkflowCode, WorkflowInstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    Running,
    /// Pause requested: nothing new is dispatched, running tasks finish.
    Pausing,
    Paused,
    Succeeded,
    Failed,
    Stopped,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Succeeded | WorkflowState::Failed | WorkflowState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    Manual,
    Schedule,
    Api,
    /// Re-run of a failed instance that keeps the already succeeded nodes.
    RecoverFailed,
}

/// One triggered execution of a workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub definition_code: WorkflowCode,
    pub definition_version: u32,
    pub state: WorkflowState,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub failure_strategy: FailureStrategy,
    pub priority: Priority,
    pub params: BTreeMap<String, String>,
    pub is_sub_workflow: bool,

    /// Master owning (and exclusively mutating) this instance.
    pub host: Host,
    pub trigger: TriggerType,
    pub recovered_from: Option<WorkflowInstanceId>,

    /// First required node that failed, reported with a FAILED state.
    pub first_failed_node: Option<NodeCode>,
}

impl WorkflowInstance {
    pub fn new(definition: &WorkflowDefinition, host: Host, trigger: TriggerType, params: BTreeMap<String, String>) -> Self {
        Self {
            id: WorkflowInstanceId::random(),
            definition_code: definition.code.clone(),
            definition_version: definition.version,
            state: WorkflowState::Created,
            start_time: None,
            end_time: None,
            failure_strategy: definition.failure_strategy,
            priority: definition.priority,
            params,
            is_sub_workflow: false,
            host,
            trigger,
            recovered_from: None,
            first_failed_node: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
