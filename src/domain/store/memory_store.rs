use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::model::definition::WorkflowDefinition;
use crate::domain::model::task_instance::TaskInstance;
use crate::domain::model::workflow_instance::WorkflowInstance;
use crate::domain::store::metadata_store::MetadataStore;
use crate::domain::utils::id::{Host, TaskInstanceId, WorkflowCode, WorkflowInstanceId};
use crate::error::StoreError;

new_key_type! {
    pub struct WorkflowKey;
    pub struct TaskKey;
}

#[derive(Debug, Default)]
struct StoreInner {
    definitions: HashMap<(WorkflowCode, u32), WorkflowDefinition>,

    workflows: SlotMap<WorkflowKey, WorkflowInstance>,
    workflow_index: HashMap<WorkflowInstanceId, WorkflowKey>,

    tasks: SlotMap<TaskKey, TaskInstance>,
    task_index: HashMap<TaskInstanceId, TaskKey>,
    /// Task keys grouped by workflow instance, in insertion order.
    tasks_by_workflow: HashMap<WorkflowInstanceId, Vec<TaskKey>>,
}

impl StoreInner {
    fn workflow_is_terminal(&self, id: &WorkflowInstanceId) -> bool {
        self.workflow_index.get(id).and_then(|key| self.workflows.get(*key)).is_some_and(|wf| wf.is_terminal())
    }
}

/// In-memory `MetadataStore`. All maps sit behind a single lock, cloned
/// handles share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn MetadataStore> {
        Arc::new(Self::new())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn save_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.definitions.insert((definition.code.clone(), definition.version), definition);
        Ok(())
    }

    fn get_definition(&self, code: &WorkflowCode, version: u32) -> Result<WorkflowDefinition, StoreError> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .definitions
            .get(&(code.clone(), version))
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound { code: code.to_string(), version })
    }

    fn save_workflow(&self, workflow: WorkflowInstance) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        match guard.workflow_index.get(&workflow.id).copied() {
            Some(key) => {
                let stored = &mut guard.workflows[key];
                if stored.is_terminal() {
                    return Err(StoreError::TerminalWorkflow(workflow.id));
                }
                *stored = workflow;
            }
            None => {
                let id = workflow.id.clone();
                let key = guard.workflows.insert(workflow);
                guard.workflow_index.insert(id, key);
            }
        }
        Ok(())
    }

    fn get_workflow(&self, id: &WorkflowInstanceId) -> Result<WorkflowInstance, StoreError> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .workflow_index
            .get(id)
            .and_then(|key| guard.workflows.get(*key))
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.clone()))
    }

    fn list_active_workflows_by_host(&self, host: &Host) -> Vec<WorkflowInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.workflows.values().filter(|wf| !wf.is_terminal() && &wf.host == host).cloned().collect()
    }

    fn list_active_workflows(&self) -> Vec<WorkflowInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.workflows.values().filter(|wf| !wf.is_terminal()).cloned().collect()
    }

    fn save_task(&self, task: TaskInstance) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if guard.workflow_is_terminal(&task.workflow_instance_id) {
            return Err(StoreError::TerminalWorkflow(task.workflow_instance_id));
        }

        match guard.task_index.get(&task.id).copied() {
            Some(key) => guard.tasks[key] = task,
            None => {
                let id = task.id.clone();
                let workflow_id = task.workflow_instance_id.clone();
                let key = guard.tasks.insert(task);
                guard.task_index.insert(id, key);
                guard.tasks_by_workflow.entry(workflow_id).or_default().push(key);
            }
        }
        Ok(())
    }

    fn get_task(&self, id: &TaskInstanceId) -> Option<TaskInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let key = guard.task_index.get(id)?;
        guard.tasks.get(*key).cloned()
    }

    fn list_tasks_by_workflow(&self, workflow_id: &WorkflowInstanceId) -> Vec<TaskInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .tasks_by_workflow
            .get(workflow_id)
            .map(|keys| keys.iter().filter_map(|key| guard.tasks.get(*key)).cloned().collect())
            .unwrap_or_default()
    }

    fn list_active_tasks_by_worker(&self, worker: &Host) -> Vec<TaskInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.tasks.values().filter(|t| t.state.is_on_worker() && t.host.as_ref() == Some(worker)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::definition::{TaskDefinition, TaskKind};
    use crate::domain::model::task_instance::TaskState;
    use crate::domain::model::workflow_instance::{TriggerType, WorkflowState};
    use std::collections::BTreeMap;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", vec![TaskDefinition::new("a", TaskKind::Noop)], vec![])
    }

    fn workflow(host: &str) -> WorkflowInstance {
        WorkflowInstance::new(&definition(), Host::new(host), TriggerType::Manual, BTreeMap::new())
    }

    #[test]
    fn terminal_workflow_rejects_further_writes() {
        let store = MemoryMetadataStore::new();
        let mut wf = workflow("m1:1");
        store.save_workflow(wf.clone()).unwrap();

        wf.state = WorkflowState::Succeeded;
        store.save_workflow(wf.clone()).unwrap();

        wf.state = WorkflowState::Running;
        assert!(matches!(store.save_workflow(wf.clone()), Err(StoreError::TerminalWorkflow(_))));
        assert_eq!(store.get_workflow(&wf.id).unwrap().state, WorkflowState::Succeeded);

        let task = TaskInstance::new(wf.id.clone(), &definition().tasks[0]);
        assert!(store.save_task(task).is_err());
    }

    #[test]
    fn lists_active_workflows_of_one_host() {
        let store = MemoryMetadataStore::new();
        let mine = workflow("m1:1");
        let other = workflow("m2:1");
        let mut done = workflow("m1:1");
        done.state = WorkflowState::Failed;

        for wf in [mine.clone(), other, done] {
            store.save_workflow(wf).unwrap();
        }

        let active = store.list_active_workflows_by_host(&Host::new("m1:1"));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, mine.id);
        assert_eq!(store.list_active_workflows().len(), 2);
    }

    #[test]
    fn tasks_are_indexed_by_workflow_and_worker() {
        let store = MemoryMetadataStore::new();
        let wf = workflow("m1:1");
        store.save_workflow(wf.clone()).unwrap();

        let mut task = TaskInstance::new(wf.id.clone(), &definition().tasks[0]);
        store.save_task(task.clone()).unwrap();
        assert!(store.list_active_tasks_by_worker(&Host::new("w1:1")).is_empty());

        task.state = TaskState::Running;
        task.host = Some(Host::new("w1:1"));
        store.save_task(task.clone()).unwrap();

        assert_eq!(store.list_tasks_by_workflow(&wf.id).len(), 1);
        assert_eq!(store.list_active_tasks_by_worker(&Host::new("w1:1"))[0].id, task.id);
        assert_eq!(store.get_task(&task.id).unwrap().state, TaskState::Running);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = MemoryMetadataStore::new();
        assert!(matches!(store.get_workflow(&WorkflowInstanceId::new("nope")), Err(StoreError::WorkflowNotFound(_))));
        assert!(matches!(store.get_definition(&WorkflowCode::new("nope"), 1), Err(StoreError::DefinitionNotFound { .. })));
    }
}
