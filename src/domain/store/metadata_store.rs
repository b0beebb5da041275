use crate::domain::model::definition::WorkflowDefinition;
use crate::domain::model::task_instance::TaskInstance;
use crate::domain::model::workflow_instance::WorkflowInstance;
use crate::domain::utils::id::{Host, TaskInstanceId, WorkflowCode, WorkflowInstanceId};
use crate::error::StoreError;

/// Persistence boundary of the engine. The engine writes through on every
/// state change, so a master taking over a workflow sees the last state
/// its previous owner reached.
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    fn save_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    fn get_definition(&self, code: &WorkflowCode, version: u32) -> Result<WorkflowDefinition, StoreError>;

    /// Inserts or updates a workflow instance. Fails if the stored instance
    /// already reached a terminal state.
    fn save_workflow(&self, workflow: WorkflowInstance) -> Result<(), StoreError>;

    fn get_workflow(&self, id: &WorkflowInstanceId) -> Result<WorkflowInstance, StoreError>;

    /// Non-terminal workflow instances owned by `host`.
    fn list_active_workflows_by_host(&self, host: &Host) -> Vec<WorkflowInstance>;

    fn list_active_workflows(&self) -> Vec<WorkflowInstance>;

    /// Inserts or updates a task instance. Fails if its workflow is terminal.
    fn save_task(&self, task: TaskInstance) -> Result<(), StoreError>;

    fn get_task(&self, id: &TaskInstanceId) -> Option<TaskInstance>;

    fn list_tasks_by_workflow(&self, workflow_id: &WorkflowInstanceId) -> Vec<TaskInstance>;

    /// Tasks currently held by the given worker (DISPATCHED or RUNNING).
    fn list_active_tasks_by_worker(&self, worker: &Host) -> Vec<TaskInstance>;
}
