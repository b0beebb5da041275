use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::alert::alert_client::AlertNotifier;
use crate::domain::clock::SharedClock;
use crate::domain::config::MasterConfig;
use crate::domain::dag::dag_engine::{DagEngine, NodeOutcome};
use crate::domain::dag::workflow_dag::WorkflowDag;
use crate::domain::dispatch::dispatcher::{Dispatcher, ExecutionContext};
use crate::domain::engine::events::{WorkflowEvent, WorkflowSnapshot};
use crate::domain::engine::task_runnable::{DispatchPolicy, KillOrder, TaskOutcome, TaskRunnable, Transition};
use crate::domain::model::definition::{FailureStrategy, WorkflowDefinition};
use crate::domain::model::task_instance::{TaskInstance, TaskState};
use crate::domain::model::workflow_instance::{WorkflowInstance, WorkflowState};
use crate::domain::rpc::protocol::{AlertLevel, AlertMessage};
use crate::domain::store::metadata_store::MetadataStore;
use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};
use crate::domain::utils::statistics::{StatParameter, StatisticEvent, StatsCollector};
use crate::error::{DispatchError, EngineError};

/// Collaborators shared by all workflow runnables of one master.
pub struct EngineContext {
    pub store: Arc<dyn MetadataStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: SharedClock,
    pub config: MasterConfig,
    pub stats: StatsCollector,
    pub alert: Option<Arc<dyn AlertNotifier>>,
    /// Cancelled when the master stops. Runnables then detach without
    /// finishing so that another master can take their workflows over.
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn master_host(&self) -> &Host {
        self.dispatcher.master_host()
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_retries: self.config.max_dispatch_retries,
            backoff_base: self.config.dispatch_backoff_base,
            backoff_max: self.config.dispatch_backoff_max,
        }
    }
}

/// Sending side of a running workflow.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    pub id: WorkflowInstanceId,
    tx: mpsc::UnboundedSender<WorkflowEvent>,
    state: watch::Receiver<WorkflowState>,
}

impl WorkflowHandle {
    pub fn send(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        self.tx.send(event).map_err(|_| EngineError::RunnableClosed(self.id.clone()))
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkflowState> {
        self.state.clone()
    }
}

pub type RunnableMap = Arc<Mutex<HashMap<WorkflowInstanceId, WorkflowHandle>>>;

/// Single writer of one workflow instance and all of its task instances.
///
/// Consumes its event queue strictly in order, ticks for timeouts and
/// delayed dispatches, and writes every state change through to the store.
pub struct WorkflowRunnable {
    ctx: Arc<EngineContext>,
    definition: Arc<WorkflowDefinition>,
    workflow: WorkflowInstance,
    dag: DagEngine,

    tasks: HashMap<TaskInstanceId, TaskRunnable>,
    /// Task ids in creation order.
    order: Vec<TaskInstanceId>,
    node_tasks: HashMap<NodeCode, TaskInstanceId>,
    /// Tasks for which "no worker available" was already logged.
    waiting_for_host: HashSet<TaskInstanceId>,
    /// Set once a stop or fail-fast began killing tasks.
    stopping: bool,

    tx: mpsc::UnboundedSender<WorkflowEvent>,
    rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    state_tx: watch::Sender<WorkflowState>,
    runnables: RunnableMap,
}

impl WorkflowRunnable {
    /// Builds the runnable and registers its handle in `runnables`.
    ///
    /// `tasks` are previously persisted task instances (recovery and take
    /// over). Their terminal outcomes are replayed into the DAG in
    /// topological order, nodes owning a non-terminal task are never
    /// scheduled again.
    pub fn create(
        ctx: Arc<EngineContext>,
        definition: Arc<WorkflowDefinition>,
        workflow: WorkflowInstance,
        tasks: Vec<TaskInstance>,
        runnables: RunnableMap,
    ) -> Result<(Self, WorkflowHandle), EngineError> {
        let mut dag = DagEngine::new(Arc::new(WorkflowDag::build(&definition)?));
        let tasks: Vec<TaskInstance> = tasks
            .into_iter()
            .filter(|task| {
                let known = dag.status(&task.node_code).is_some();
                if !known {
                    log::warn!("Dropping task {} of unknown node {}", task.id, task.node_code);
                }
                known
            })
            .collect();
        replay(&mut dag, &tasks);

        let order: Vec<TaskInstanceId> = tasks.iter().map(|t| t.id.clone()).collect();
        let node_tasks: HashMap<NodeCode, TaskInstanceId> = tasks.iter().map(|t| (t.node_code.clone(), t.id.clone())).collect();
        let runnable_tasks: HashMap<TaskInstanceId, TaskRunnable> = tasks.into_iter().map(|t| (t.id.clone(), TaskRunnable::new(t))).collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(workflow.state);
        let handle = WorkflowHandle { id: workflow.id.clone(), tx: tx.clone(), state: state_rx };
        runnables.lock().expect("Mutex poisoned").insert(workflow.id.clone(), handle.clone());

        let runnable = Self {
            ctx,
            definition,
            workflow,
            dag,
            tasks: runnable_tasks,
            order,
            node_tasks,
            waiting_for_host: HashSet::new(),
            stopping: false,
            tx,
            rx,
            state_tx,
            runnables,
        };
        Ok((runnable, handle))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ctx.config.state_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = self.ctx.shutdown.clone();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Workflow {} detached, master is shutting down", self.workflow.id);
                    self.deregister();
                    return;
                }
                Some(event) = self.rx.recv() => event,
                _ = ticker.tick() => WorkflowEvent::Tick,
            };

            self.handle(event).await;
            if self.workflow.is_terminal() {
                break;
            }
        }
        self.finalize();
    }

    async fn handle(&mut self, event: WorkflowEvent) {
        let now = self.ctx.clock.now_ms();
        let policy = self.ctx.dispatch_policy();

        match event {
            WorkflowEvent::Start => self.on_start(),
            WorkflowEvent::TaskAck { task_instance_id, attempt, status } => {
                self.update_task(&task_instance_id, |t| t.on_ack(attempt, status, now, &policy));
            }
            WorkflowEvent::TaskResult(result) => {
                if result.workflow_instance_id != self.workflow.id {
                    log::warn!("Result for workflow {} routed to {}", result.workflow_instance_id, self.workflow.id);
                } else {
                    self.update_task(&result.task_instance_id, |t| t.on_result(result.attempt, result.status, now));
                }
            }
            WorkflowEvent::DispatchFailed { task_instance_id, attempt, reason } => {
                log::warn!("Dispatch of task {} attempt {} failed: {}", task_instance_id, attempt, reason);
                self.update_task(&task_instance_id, |t| t.on_dispatch_failed(attempt, now, &policy));
            }
            WorkflowEvent::Tick => self.on_tick(now, &policy),
            WorkflowEvent::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            WorkflowEvent::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            WorkflowEvent::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            WorkflowEvent::KillTask { node, reply } => {
                let _ = reply.send(self.kill_task(&node, now));
            }
            WorkflowEvent::WorkerLost { host, reply } => {
                let count = self.worker_lost(&host, now);
                if let Some(reply) = reply {
                    let _ = reply.send(count);
                }
            }
            WorkflowEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                return;
            }
        }

        if !self.workflow.is_terminal() {
            self.schedule_ready();
            self.dispatch_pending().await;
            self.check_completion();
        }
    }

    fn on_start(&mut self) {
        match self.workflow.state {
            WorkflowState::Created => {
                self.workflow.state = WorkflowState::Running;
                self.workflow.start_time = Some(self.ctx.clock.now_ms());
                self.workflow.host = self.ctx.master_host().clone();
                self.publish_state();
                tracing::info!(workflow = %self.workflow.id, definition = %self.workflow.definition_code, "workflow started");
            }
            WorkflowState::Running | WorkflowState::Pausing | WorkflowState::Paused => {
                self.workflow.host = self.ctx.master_host().clone();
                self.persist_workflow();
                tracing::info!(workflow = %self.workflow.id, state = ?self.workflow.state, "workflow resumed on this master");
                for id in self.order.clone() {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        let transition = task.reclaim();
                        self.apply(&id, transition);
                    }
                }
            }
            WorkflowState::Succeeded | WorkflowState::Failed | WorkflowState::Stopped => return,
        }
        self.dag.start();
    }

    fn on_tick(&mut self, now: i64, policy: &DispatchPolicy) {
        // The ack future times out first, this only catches lost futures.
        let ack_deadline = self.ctx.config.dispatch_ack_timeout.saturating_mul(2);
        for id in self.order.clone() {
            if self.workflow.is_terminal() {
                break;
            }
            self.update_task(&id, |t| t.check_ack_timeout(now, ack_deadline, policy));
            self.update_task(&id, |t| t.check_timeout(now));
        }
    }

    fn update_task(&mut self, id: &TaskInstanceId, event: impl FnOnce(&mut TaskRunnable) -> Transition) {
        let Some(task) = self.tasks.get_mut(id) else {
            log::debug!("Event for unknown task {} in workflow {}", id, self.workflow.id);
            return;
        };
        let transition = event(task);
        self.apply(id, transition);
    }

    fn apply(&mut self, id: &TaskInstanceId, transition: Transition) {
        if transition.is_ignored() {
            return;
        }
        if let Some(kill) = transition.kill {
            self.send_kill(id, kill);
        }
        let Some(task) = self.tasks.get(id).map(|t| t.task().clone()) else {
            return;
        };
        self.persist_task(&task);
        tracing::info!(
            workflow = %self.workflow.id,
            node = %task.node_code,
            task = %task.id,
            attempt = task.attempt,
            state = ?task.state,
            "task transition"
        );

        match transition.outcome {
            TaskOutcome::Terminal(_) => {
                self.record_task(&task);
                self.on_task_terminal(&task);
            }
            TaskOutcome::TimeoutWarning => self.raise_alert(
                AlertLevel::Warning,
                "Task timeout",
                format!("Task {} (node {}) exceeded its timeout on {:?}", task.id, task.node_code, task.host),
            ),
            TaskOutcome::Queued
            | TaskOutcome::Dispatched
            | TaskOutcome::Running
            | TaskOutcome::Paused
            | TaskOutcome::Ignored => {}
        }
    }

    fn on_task_terminal(&mut self, task: &TaskInstance) {
        let Some(outcome) = node_outcome(task.state) else {
            return;
        };
        let step = self.dag.on_node_terminal(&task.node_code, outcome);
        for skipped in &step.skipped {
            log::info!("Node {} of workflow {} skipped", skipped, self.workflow.id);
        }

        if outcome == NodeOutcome::Succeeded || !self.dag.is_required_failure(&task.node_code) {
            return;
        }
        if self.workflow.first_failed_node.is_none() {
            self.workflow.first_failed_node = Some(task.node_code.clone());
        }
        if self.workflow.failure_strategy == FailureStrategy::End && !self.stopping {
            log::warn!("Workflow {} fails fast on node {}", self.workflow.id, task.node_code);
            self.stopping = true;
            self.kill_all();
            self.finish(WorkflowState::Failed);
        }
    }

    /// Creates and starts a task instance for every ready node.
    fn schedule_ready(&mut self) {
        if self.workflow.state != WorkflowState::Running {
            return;
        }
        while let Some(code) = self.dag.pop_ready() {
            let Some(definition) = self.definition.task(&code) else {
                log::error!("Node {} has no task definition", code);
                continue;
            };
            let mut runnable = TaskRunnable::new(TaskInstance::new(self.workflow.id.clone(), definition));
            if let Err(e) = runnable.start(self.dag.dependencies_satisfied(&code)) {
                log::error!("Could not start node {}: {}", code, e);
                continue;
            }

            let id = runnable.task().id.clone();
            self.persist_task(runnable.task());
            tracing::info!(workflow = %self.workflow.id, node = %code, task = %id, "task created");
            self.node_tasks.insert(code, id.clone());
            self.order.push(id.clone());
            self.tasks.insert(id, runnable);
        }
    }

    /// Hands every task in DISPATCH whose back-off elapsed to a worker.
    async fn dispatch_pending(&mut self) {
        if self.workflow.state != WorkflowState::Running {
            return;
        }
        let now = self.ctx.clock.now_ms();
        let mut pending: Vec<TaskInstanceId> = self.order.iter().filter(|id| self.tasks[*id].ready_to_dispatch(now)).cloned().collect();
        pending.sort_by_key(|id| Reverse(self.tasks[id].task().priority));

        for id in pending {
            let group = self.tasks[&id].task().worker_group.clone();
            let host = match self.ctx.dispatcher.select_host(&group).await {
                Ok(host) => host,
                Err(DispatchError::NoAvailableHost { group }) => {
                    if self.waiting_for_host.insert(id.clone()) {
                        log::warn!("No worker available in group '{}', task {} stays in DISPATCH", group, id);
                    }
                    continue;
                }
                Err(e) => {
                    log::warn!("Selecting a worker for task {} failed: {}", id, e);
                    continue;
                }
            };
            self.waiting_for_host.remove(&id);

            let Some(task) = self.tasks.get_mut(&id) else { continue };
            if let Err(e) = task.dispatch(host.clone(), now) {
                log::warn!("{}", e);
                continue;
            }
            let context = self.ctx.dispatcher.context_for(task.task(), host);
            self.apply(&id, Transition { outcome: TaskOutcome::Dispatched, kill: None });
            self.deliver(context);
        }
    }

    /// Sends the request and feeds the ack (or the failure) back as an event.
    fn deliver(&self, context: ExecutionContext) {
        let dispatcher = self.ctx.dispatcher.clone();
        let tx = self.tx.clone();
        let timeout = self.ctx.config.dispatch_ack_timeout;

        tokio::spawn(async move {
            let sent = dispatcher.send(&context).await;
            let acked = match sent {
                Ok(ack) => dispatcher.await_ack(&context, ack, timeout).await,
                Err(e) => Err(e),
            };
            let event = match acked {
                Ok(ack) => WorkflowEvent::TaskAck { task_instance_id: context.task_instance_id, attempt: ack.attempt, status: ack.status },
                Err(e) => WorkflowEvent::DispatchFailed {
                    task_instance_id: context.task_instance_id,
                    attempt: context.attempt,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });
    }

    fn send_kill(&self, id: &TaskInstanceId, kill: KillOrder) {
        let dispatcher = self.ctx.dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.send_kill(&kill.host, &id, kill.attempt).await {
                log::warn!("Kill of task {} attempt {} on {} not delivered: {}", id, kill.attempt, kill.host, e);
            }
        });
    }

    fn check_completion(&mut self) {
        if !matches!(self.workflow.state, WorkflowState::Running | WorkflowState::Pausing) {
            return;
        }

        if self.dag.is_complete() && self.tasks.values().all(|t| t.is_terminal()) {
            let state = if self.dag.has_required_failure() { WorkflowState::Failed } else { WorkflowState::Succeeded };
            self.finish(state);
            return;
        }

        if self.workflow.state == WorkflowState::Pausing {
            for id in self.order.clone() {
                self.update_task(&id, |t| t.pause());
            }
            if !self.tasks.values().any(|t| t.state().is_on_worker()) {
                self.workflow.state = WorkflowState::Paused;
                self.publish_state();
                log::info!("Workflow {} paused", self.workflow.id);
            }
        }
    }

    fn pause(&mut self) -> Result<WorkflowState, EngineError> {
        match self.workflow.state {
            WorkflowState::Running => {}
            WorkflowState::Pausing | WorkflowState::Paused => return Ok(self.workflow.state),
            state => return Err(EngineError::InvalidWorkflowState { id: self.workflow.id.clone(), state, operation: "pause" }),
        }
        self.workflow.state = WorkflowState::Pausing;
        self.publish_state();
        self.check_completion();
        Ok(self.workflow.state)
    }

    fn resume(&mut self) -> Result<WorkflowState, EngineError> {
        match self.workflow.state {
            WorkflowState::Paused | WorkflowState::Pausing => {}
            WorkflowState::Running => return Ok(WorkflowState::Running),
            state => return Err(EngineError::InvalidWorkflowState { id: self.workflow.id.clone(), state, operation: "resume" }),
        }
        self.workflow.state = WorkflowState::Running;
        self.publish_state();

        for id in self.order.clone() {
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            if task.state() != TaskState::Paused {
                continue;
            }
            let satisfied = self.dag.dependencies_satisfied(&task.task().node_code);
            match task.start(satisfied) {
                Ok(outcome) => self.apply(&id, Transition { outcome, kill: None }),
                Err(e) => log::error!("Could not resume task {}: {}", id, e),
            }
        }
        log::info!("Workflow {} resumed", self.workflow.id);
        Ok(WorkflowState::Running)
    }

    fn stop(&mut self) -> Result<WorkflowState, EngineError> {
        if self.workflow.is_terminal() {
            return Err(EngineError::InvalidWorkflowState { id: self.workflow.id.clone(), state: self.workflow.state, operation: "stop" });
        }
        self.stopping = true;
        self.kill_all();
        self.finish(WorkflowState::Stopped);
        Ok(WorkflowState::Stopped)
    }

    fn kill_task(&mut self, node: &NodeCode, now: i64) -> Result<(), EngineError> {
        if self.dag.status(node).is_none() {
            return Err(EngineError::NodeNotFound { workflow: self.workflow.id.clone(), node: node.clone() });
        }
        if let Some(id) = self.node_tasks.get(node).cloned() {
            self.update_task(&id, |t| t.kill(now));
        }
        Ok(())
    }

    fn kill_all(&mut self) {
        let now = self.ctx.clock.now_ms();
        for id in self.order.clone() {
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            let transition = task.kill(now);
            if transition.is_ignored() {
                continue;
            }
            let task = task.task().clone();
            if let Some(kill) = transition.kill {
                self.send_kill(&id, kill);
            }
            self.persist_task(&task);
            self.record_task(&task);
        }
    }

    fn worker_lost(&mut self, host: &Host, now: i64) -> usize {
        let mut count = 0;
        for id in self.order.clone() {
            let Some(task) = self.tasks.get_mut(&id) else { continue };
            let transition = task.failover(host, now);
            if !transition.is_ignored() {
                count += 1;
                log::warn!("Task {} lost its worker {}", id, host);
                self.apply(&id, transition);
            }
            if self.workflow.is_terminal() {
                break;
            }
        }
        count
    }

    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow: self.workflow.clone(),
            tasks: self.order.iter().filter_map(|id| self.tasks.get(id)).map(|t| t.task().clone()).collect(),
            summary: self.dag.summary(),
        }
    }

    fn finish(&mut self, state: WorkflowState) {
        self.workflow.state = state;
        self.workflow.end_time = Some(self.ctx.clock.now_ms());
        self.publish_state();
    }

    fn publish_state(&mut self) {
        self.persist_workflow();
        self.state_tx.send_replace(self.workflow.state);
    }

    fn finalize(&mut self) {
        let summary = self.dag.summary();
        tracing::info!(
            workflow = %self.workflow.id,
            state = ?self.workflow.state,
            succeeded = summary.succeeded,
            failed = summary.failed,
            killed = summary.killed,
            skipped = summary.skipped,
            "workflow finished"
        );

        let mut event = StatisticEvent::new("WorkflowFinished");
        event
            .set(StatParameter::ComponentType, "MASTER")
            .set(StatParameter::ComponentName, self.ctx.master_host().to_string())
            .set(StatParameter::WorkflowCode, self.workflow.definition_code.to_string())
            .set(StatParameter::WorkflowInstance, self.workflow.id.to_string())
            .set(StatParameter::WorkflowState, format!("{:?}", self.workflow.state))
            .set(StatParameter::NumberOfTasks, self.tasks.len());
        if let Some(node) = &self.workflow.first_failed_node {
            event.set(StatParameter::FailedNode, node.to_string());
        }
        if let (Some(start), Some(end)) = (self.workflow.start_time, self.workflow.end_time) {
            event.set(StatParameter::Duration, end - start);
        }
        self.ctx.stats.add_event(event);

        if self.workflow.state == WorkflowState::Failed {
            let node = self.workflow.first_failed_node.as_ref().map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
            self.raise_alert(
                AlertLevel::Critical,
                "Workflow failed",
                format!("Workflow {} ({}) failed, first failed node: {}", self.workflow.id, self.workflow.definition_code, node),
            );
        }
        self.deregister();
    }

    fn deregister(&self) {
        self.runnables.lock().expect("Mutex poisoned").remove(&self.workflow.id);
    }

    fn record_task(&self, task: &TaskInstance) {
        let mut event = StatisticEvent::new("TaskFinished");
        event
            .set(StatParameter::ComponentType, "MASTER")
            .set(StatParameter::ComponentName, self.ctx.master_host().to_string())
            .set(StatParameter::WorkflowCode, self.workflow.definition_code.to_string())
            .set(StatParameter::WorkflowInstance, self.workflow.id.to_string())
            .set(StatParameter::TaskCode, task.node_code.to_string())
            .set(StatParameter::TaskInstance, task.id.to_string())
            .set(StatParameter::TaskState, format!("{:?}", task.state))
            .set(StatParameter::Attempt, task.attempt);
        if let Some(host) = &task.host {
            event.set(StatParameter::WorkerHost, host.to_string());
        }
        if let (Some(start), Some(end)) = (task.start_time, task.end_time) {
            event.set(StatParameter::Duration, end - start);
        }
        self.ctx.stats.add_event(event);
    }

    fn raise_alert(&self, level: AlertLevel, title: &str, content: String) {
        let Some(alert) = self.ctx.alert.clone() else {
            return;
        };
        let message = AlertMessage { level, title: title.to_string(), content, workflow_instance_id: Some(self.workflow.id.clone()) };
        tokio::spawn(async move {
            if let Err(e) = alert.notify(message).await {
                log::warn!("Alert not delivered: {}", e);
            }
        });
    }

    fn persist_workflow(&self) {
        if let Err(e) = self.ctx.store.save_workflow(self.workflow.clone()) {
            log::error!("Persisting workflow {} failed: {}", self.workflow.id, e);
        }
    }

    fn persist_task(&self, task: &TaskInstance) {
        if let Err(e) = self.ctx.store.save_task(task.clone()) {
            log::error!("Persisting task {} failed: {}", task.id, e);
        }
    }
}

/// Rebuilds DAG progress from persisted task instances.
///
/// Nodes owning a task are marked running first so that replaying the
/// terminal outcomes in topological order never enqueues them again.
pub(crate) fn replay(dag: &mut DagEngine, tasks: &[TaskInstance]) {
    for task in tasks {
        dag.restore_running(&task.node_code);
    }
    for code in dag.dag().topological_order() {
        let outcome = tasks.iter().find(|t| t.node_code == code).and_then(|t| node_outcome(t.state));
        if let Some(outcome) = outcome {
            dag.on_node_terminal(&code, outcome);
        }
    }
}

fn node_outcome(state: TaskState) -> Option<NodeOutcome> {
    match state {
        TaskState::Succeeded => Some(NodeOutcome::Succeeded),
        TaskState::Failed => Some(NodeOutcome::Failed),
        TaskState::Killed => Some(NodeOutcome::Killed),
        TaskState::Created
        | TaskState::Dispatch
        | TaskState::Dispatched
        | TaskState::Running
        | TaskState::Paused => None,
    }
}
