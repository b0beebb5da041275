use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::dag::dag_engine::DagEngine;
use crate::domain::dag::workflow_dag::WorkflowDag;
use crate::domain::engine::events::{Reply, WorkflowEvent, WorkflowSnapshot};
use crate::domain::engine::workflow_runnable::{EngineContext, RunnableMap, WorkflowHandle, WorkflowRunnable, replay};
use crate::domain::model::definition::WorkflowDefinition;
use crate::domain::model::task_instance::{TaskInstance, TaskState};
use crate::domain::model::workflow_instance::{TriggerType, WorkflowInstance, WorkflowState};
use crate::domain::rpc::protocol::TaskExecuteResult;
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};
use crate::error::{EngineError, StoreError};

/// Entry point of a master into the execution engine.
///
/// Owns the set of workflow runnables of this master and routes external
/// commands and worker reports to them. All state changes happen inside the
/// runnables, the engine itself only reads.
pub struct WorkflowEngine {
    ctx: Arc<EngineContext>,
    runnables: RunnableMap,
}

impl WorkflowEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx: Arc::new(ctx), runnables: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn master_host(&self) -> &Host {
        self.ctx.master_host()
    }

    /// Creates a new workflow instance owned by this master and starts it.
    pub fn trigger(
        &self,
        definition: WorkflowDefinition,
        trigger: TriggerType,
        params: BTreeMap<String, String>,
    ) -> Result<WorkflowInstanceId, EngineError> {
        WorkflowDag::build(&definition)?;
        self.ctx.store.save_definition(definition.clone())?;

        let workflow = WorkflowInstance::new(&definition, self.master_host().clone(), trigger, params);
        let id = workflow.id.clone();
        self.ctx.store.save_workflow(workflow.clone())?;
        log::info!("Triggered workflow {} ({} v{}) via {:?}", id, definition.code, definition.version, trigger);

        self.launch(Arc::new(definition), workflow, Vec::new())?;
        Ok(id)
    }

    /// Re-runs a failed instance as a new instance. Succeeded nodes are
    /// carried over and not executed again.
    pub fn recover_failed(&self, id: &WorkflowInstanceId) -> Result<WorkflowInstanceId, EngineError> {
        let failed = self.ctx.store.get_workflow(id)?;
        if failed.state != WorkflowState::Failed {
            return Err(EngineError::InvalidWorkflowState { id: id.clone(), state: failed.state, operation: "recover_failed" });
        }
        let definition = self.ctx.store.get_definition(&failed.definition_code, failed.definition_version)?;

        let mut workflow = WorkflowInstance::new(&definition, self.master_host().clone(), TriggerType::RecoverFailed, failed.params.clone());
        workflow.recovered_from = Some(id.clone());
        self.ctx.store.save_workflow(workflow.clone())?;

        let carried: Vec<TaskInstance> = self
            .ctx
            .store
            .list_tasks_by_workflow(id)
            .into_iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .map(|t| TaskInstance { id: TaskInstanceId::random(), workflow_instance_id: workflow.id.clone(), ..t })
            .collect();
        for task in &carried {
            self.ctx.store.save_task(task.clone())?;
        }
        log::info!("Recovering workflow {} as {}, {} succeeded nodes carried over", id, workflow.id, carried.len());

        let new_id = workflow.id.clone();
        self.launch(Arc::new(definition), workflow, carried)?;
        Ok(new_id)
    }

    /// Adopts a non-terminal workflow whose master died. Tasks that were
    /// held by workers which are gone as well are failed over right away.
    pub async fn take_over(&self, id: &WorkflowInstanceId) -> Result<(), EngineError> {
        if self.handle(id).is_some() {
            return Ok(());
        }
        let mut workflow = self.ctx.store.get_workflow(id)?;
        if workflow.is_terminal() {
            return Ok(());
        }
        let previous = workflow.host.clone();
        workflow.host = self.master_host().clone();
        self.ctx.store.save_workflow(workflow.clone())?;
        let definition = self.ctx.store.get_definition(&workflow.definition_code, workflow.definition_version)?;
        let tasks = self.ctx.store.list_tasks_by_workflow(id);

        let live: HashSet<Host> = self.ctx.dispatcher.live_workers().await?.into_iter().map(|w| w.host).collect();
        let lost: HashSet<Host> = tasks
            .iter()
            .filter(|t| t.state.is_on_worker())
            .filter_map(|t| t.host.clone())
            .filter(|host| !live.contains(host))
            .collect();

        log::info!("Taking over workflow {} from {}", id, previous);
        let handle = self.launch(Arc::new(definition), workflow, tasks)?;
        for host in lost {
            handle.send(WorkflowEvent::WorkerLost { host, reply: None })?;
        }
        Ok(())
    }

    fn launch(&self, definition: Arc<WorkflowDefinition>, workflow: WorkflowInstance, tasks: Vec<TaskInstance>) -> Result<WorkflowHandle, EngineError> {
        let (runnable, handle) = WorkflowRunnable::create(self.ctx.clone(), definition, workflow, tasks, self.runnables.clone())?;
        runnable.spawn();
        handle.send(WorkflowEvent::Start)?;
        Ok(handle)
    }

    pub fn handle(&self, id: &WorkflowInstanceId) -> Option<WorkflowHandle> {
        self.runnables.lock().expect("Mutex poisoned").get(id).cloned()
    }

    pub fn active_workflows(&self) -> Vec<WorkflowInstanceId> {
        self.runnables.lock().expect("Mutex poisoned").keys().cloned().collect()
    }

    pub async fn pause(&self, id: &WorkflowInstanceId) -> Result<WorkflowState, EngineError> {
        self.request(id, "pause", WorkflowEvent::Pause).await
    }

    pub async fn resume(&self, id: &WorkflowInstanceId) -> Result<WorkflowState, EngineError> {
        self.request(id, "resume", WorkflowEvent::Resume).await
    }

    pub async fn stop(&self, id: &WorkflowInstanceId) -> Result<WorkflowState, EngineError> {
        self.request(id, "stop", WorkflowEvent::Stop).await
    }

    /// Kills the task of one node. A node without task, or with a terminal
    /// task, is left as is.
    pub async fn kill_task(&self, id: &WorkflowInstanceId, node: &NodeCode) -> Result<(), EngineError> {
        let node = node.clone();
        self.request(id, "kill_task", |reply| WorkflowEvent::KillTask { node, reply }).await
    }

    async fn request<T>(
        &self,
        id: &WorkflowInstanceId,
        operation: &'static str,
        event: impl FnOnce(Reply<T>) -> WorkflowEvent,
    ) -> Result<T, EngineError> {
        let Some(handle) = self.handle(id) else {
            return Err(self.not_running(id, operation));
        };
        let (tx, rx) = oneshot::channel();
        if handle.send(event(tx)).is_err() {
            return Err(self.not_running(id, operation));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.not_running(id, operation)),
        }
    }

    fn not_running(&self, id: &WorkflowInstanceId, operation: &'static str) -> EngineError {
        match self.ctx.store.get_workflow(id) {
            Ok(workflow) => EngineError::InvalidWorkflowState { id: id.clone(), state: workflow.state, operation },
            Err(_) => EngineError::WorkflowNotFound(id.clone()),
        }
    }

    /// Current view of an instance, from its runnable or from the store once
    /// it finished.
    pub async fn snapshot(&self, id: &WorkflowInstanceId) -> Result<WorkflowSnapshot, EngineError> {
        if let Some(handle) = self.handle(id) {
            let (tx, rx) = oneshot::channel();
            if handle.send(WorkflowEvent::Snapshot(tx)).is_ok() {
                if let Ok(snapshot) = rx.await {
                    return Ok(snapshot);
                }
            }
        }
        self.stored_snapshot(id)
    }

    fn stored_snapshot(&self, id: &WorkflowInstanceId) -> Result<WorkflowSnapshot, EngineError> {
        let workflow = self.ctx.store.get_workflow(id).map_err(|e| match e {
            StoreError::WorkflowNotFound(id) => EngineError::WorkflowNotFound(id),
            other => other.into(),
        })?;
        let definition = self.ctx.store.get_definition(&workflow.definition_code, workflow.definition_version)?;
        let tasks = self.ctx.store.list_tasks_by_workflow(id);

        let mut dag = DagEngine::new(Arc::new(WorkflowDag::build(&definition)?));
        replay(&mut dag, &tasks);
        Ok(WorkflowSnapshot { workflow, tasks, summary: dag.summary() })
    }

    /// Waits until the instance reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: &WorkflowInstanceId, timeout: Duration) -> Result<WorkflowState, EngineError> {
        self.wait_for_state(id, timeout, WorkflowState::is_terminal).await
    }

    /// Waits until the instance state matches `condition`. Returns the last
    /// seen state on timeout.
    pub async fn wait_for_state(
        &self,
        id: &WorkflowInstanceId,
        timeout: Duration,
        condition: impl Fn(&WorkflowState) -> bool,
    ) -> Result<WorkflowState, EngineError> {
        let Some(handle) = self.handle(id) else {
            return Ok(self.ctx.store.get_workflow(id).map_err(|_| EngineError::WorkflowNotFound(id.clone()))?.state);
        };
        let mut state = handle.watch_state();
        let waited = tokio::time::timeout(timeout, state.wait_for(|s| condition(s))).await.map(|r| r.map(|reached| *reached));
        match waited {
            Ok(Ok(reached)) => Ok(reached),
            // Runnable gone (detached on shutdown or finished between checks).
            Ok(Err(_)) => Ok(self.ctx.store.get_workflow(id)?.state),
            Err(_) => Ok(*state.borrow()),
        }
    }

    /// Routes a worker's terminal report. Returns false if no runnable of
    /// this master owns the workflow.
    pub fn on_task_result(&self, result: TaskExecuteResult) -> bool {
        let Some(handle) = self.handle(&result.workflow_instance_id) else {
            return false;
        };
        handle.send(WorkflowEvent::TaskResult(result)).is_ok()
    }

    /// Fails over every task of this master held by `worker`. Returns the
    /// number of affected tasks.
    pub async fn failover_worker(&self, worker: &Host) -> usize {
        let handles: Vec<WorkflowHandle> = self.runnables.lock().expect("Mutex poisoned").values().cloned().collect();
        let mut affected = 0;
        for handle in handles {
            let (tx, rx) = oneshot::channel();
            if handle.send(WorkflowEvent::WorkerLost { host: worker.clone(), reply: Some(tx) }).is_err() {
                continue;
            }
            affected += rx.await.unwrap_or(0);
        }
        if affected > 0 {
            log::warn!("Failed over {} tasks of lost worker {}", affected, worker);
        }
        affected
    }

    /// Detaches every runnable without finishing its workflow.
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
    }
}
