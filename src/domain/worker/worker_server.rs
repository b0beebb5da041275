use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::clock::SharedClock;
use crate::domain::cluster::heartbeat::{HeartbeatTask, NodeHeartbeat};
use crate::domain::config::{ClusterConfig, WorkerConfig};
use crate::domain::model::cluster_node::NodeRole;
use crate::domain::registry::registry_client::RegistryClient;
use crate::domain::registry::registry_path::worker_path;
use crate::domain::rpc::client::RpcClient;
use crate::domain::rpc::processor::{CommandProcessor, RequestContext};
use crate::domain::rpc::protocol::{AckStatus, CommandType, Payload, TaskExecuteRequest, TaskExecuteResult};
use crate::domain::rpc::server::RpcServer;
use crate::domain::utils::id::{Host, TaskInstanceId, WorkflowInstanceId};
use crate::domain::worker::plugin_registry::TaskPluginRegistry;
use crate::domain::worker::task_executor::{ExecutionOutcome, TaskExecutionContext, TaskExecutor};
use crate::error::Result;

struct RunningTask {
    attempt: u32,
    cancel: CancellationToken,
}

enum Admission {
    New(Arc<dyn TaskExecutor>, CancellationToken, OwnedSemaphorePermit),
    Duplicate,
    Overloaded,
    Rejected(String),
}

/// Where the results of one workflow go, and how many of its attempts are
/// still running or being reported.
struct WorkflowRoute {
    master: Host,
    in_flight: u32,
}

/// State shared by the worker's processors and its execution tasks.
struct WorkerState {
    host: Host,
    config: WorkerConfig,
    plugins: Arc<TaskPluginRegistry>,
    rpc: RpcClient,
    clock: SharedClock,
    slots: Arc<Semaphore>,
    pending: Arc<AtomicU32>,
    running: Mutex<HashMap<TaskInstanceId, RunningTask>>,
    /// Highest attempt accepted per task, until its result is reported.
    attempts: Mutex<HashMap<TaskInstanceId, u32>>,
    routes: Mutex<HashMap<WorkflowInstanceId, WorkflowRoute>>,
    shutdown: CancellationToken,
}

impl WorkerState {
    fn admit(&self, request: &TaskExecuteRequest) -> Admission {
        let mut attempts = self.attempts.lock().expect("Mutex poisoned");
        match attempts.get(&request.task_instance_id) {
            Some(&seen) if seen == request.attempt => return Admission::Duplicate,
            Some(&seen) if seen > request.attempt => {
                return Admission::Rejected(format!("attempt {} is older than {}", request.attempt, seen));
            }
            _ => {}
        }
        let Some(executor) = self.plugins.get(request.kind) else {
            return Admission::Rejected(format!("no executor for {:?}", request.kind));
        };
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Admission::Overloaded;
        };
        attempts.insert(request.task_instance_id.clone(), request.attempt);
        drop(attempts);
        self.pending.fetch_add(1, Ordering::Relaxed);

        self.routes
            .lock()
            .expect("Mutex poisoned")
            .entry(request.workflow_instance_id.clone())
            .and_modify(|route| {
                route.master = request.master_host.clone();
                route.in_flight += 1;
            })
            .or_insert_with(|| WorkflowRoute { master: request.master_host.clone(), in_flight: 1 });

        let cancel = self.shutdown.child_token();
        let previous = self
            .running
            .lock()
            .expect("Mutex poisoned")
            .insert(request.task_instance_id.clone(), RunningTask { attempt: request.attempt, cancel: cancel.clone() });
        if let Some(previous) = previous {
            log::warn!("Task {} attempt {} superseded by attempt {}", request.task_instance_id, previous.attempt, request.attempt);
            previous.cancel.cancel();
        }
        Admission::New(executor, cancel, permit)
    }

    async fn run(self: Arc<Self>, executor: Arc<dyn TaskExecutor>, ctx: TaskExecutionContext, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
        let start_time = self.clock.now_ms();
        let outcome = if cancel.is_cancelled() {
            ExecutionOutcome::killed()
        } else {
            tracing::info!(task = %ctx.task_instance_id, node = %ctx.node_code, attempt = ctx.attempt, "executing task");
            executor.execute(&ctx, cancel.clone()).await
        };
        drop(permit);
        let end_time = self.clock.now_ms();

        {
            let mut running = self.running.lock().expect("Mutex poisoned");
            if running.get(&ctx.task_instance_id).is_some_and(|r| r.attempt == ctx.attempt) {
                running.remove(&ctx.task_instance_id);
            }
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(task = %ctx.task_instance_id, attempt = ctx.attempt, status = ?outcome.status, "task finished");

        let result = TaskExecuteResult {
            task_instance_id: ctx.task_instance_id.clone(),
            workflow_instance_id: ctx.workflow_instance_id.clone(),
            attempt: ctx.attempt,
            status: outcome.status,
            worker_host: self.host.clone(),
            start_time,
            end_time,
            exit_code: outcome.exit_code,
            message: outcome.message,
        };
        self.report(result).await;
        self.release(&ctx.task_instance_id, &ctx.workflow_instance_id, ctx.attempt);
    }

    /// Forgets an attempt once its result is out of the worker's hands.
    fn release(&self, task_instance_id: &TaskInstanceId, workflow_instance_id: &WorkflowInstanceId, attempt: u32) {
        {
            let mut attempts = self.attempts.lock().expect("Mutex poisoned");
            if attempts.get(task_instance_id) == Some(&attempt) {
                attempts.remove(task_instance_id);
            }
        }
        let mut routes = self.routes.lock().expect("Mutex poisoned");
        if let Some(route) = routes.get_mut(workflow_instance_id) {
            route.in_flight = route.in_flight.saturating_sub(1);
            if route.in_flight == 0 {
                routes.remove(workflow_instance_id);
            }
        }
    }

    fn master_of(&self, workflow_instance_id: &WorkflowInstanceId) -> Option<Host> {
        self.routes.lock().expect("Mutex poisoned").get(workflow_instance_id).map(|route| route.master.clone())
    }

    /// Attempts admitted and not yet reported, and workflows they belong to.
    fn tracked(&self) -> (usize, usize) {
        (self.attempts.lock().expect("Mutex poisoned").len(), self.routes.lock().expect("Mutex poisoned").len())
    }

    /// Sends the result until the owning master acknowledges it. The master
    /// is looked up on every try so that a take over redirects the retries.
    async fn report(&self, result: TaskExecuteResult) {
        if self.shutdown.is_cancelled() {
            // Left to the failover of this worker.
            log::info!("Worker stopping, result of task {} attempt {} not reported", result.task_instance_id, result.attempt);
            return;
        }
        for attempt in 1..=self.config.max_result_retries.max(1) {
            let Some(master) = self.master_of(&result.workflow_instance_id) else {
                log::error!("No master known for workflow {}", result.workflow_instance_id);
                return;
            };

            match self.rpc.send_sync(&master, Payload::TaskExecuteResult(result.clone()), self.rpc.request_timeout()).await {
                Ok(Payload::TaskExecuteResultAck { .. }) => return,
                Ok(other) => log::warn!("Result of task {} not acknowledged by {}: {:?}", result.task_instance_id, master, other),
                Err(e) => log::warn!("Result of task {} not delivered to {} (try {}): {}", result.task_instance_id, master, attempt, e),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.result_retry_interval) => {}
            }
        }
        log::error!("Giving up on result of task {} attempt {}", result.task_instance_id, result.attempt);
    }

    fn kill(&self, task_instance_id: &TaskInstanceId, attempt: u32) -> bool {
        let running = self.running.lock().expect("Mutex poisoned");
        match running.get(task_instance_id) {
            Some(task) if task.attempt == attempt => {
                task.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

struct TaskExecuteProcessor {
    state: Arc<WorkerState>,
}

#[async_trait]
impl CommandProcessor for TaskExecuteProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskExecuteRequest
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::TaskExecuteRequest(request) = payload else {
            return Some(Payload::error("expected TASK_EXECUTE_REQUEST"));
        };

        let (status, message) = match self.state.admit(&request) {
            Admission::New(executor, cancel, permit) => {
                tokio::spawn(self.state.clone().run(executor, TaskExecutionContext::from(&request), cancel, permit));
                (AckStatus::Accepted, None)
            }
            Admission::Duplicate => (AckStatus::Accepted, Some("duplicate".to_string())),
            Admission::Overloaded => {
                log::debug!("No free execution slot for task {} attempt {}", request.task_instance_id, request.attempt);
                (AckStatus::Overloaded, Some("no free execution slot".to_string()))
            }
            Admission::Rejected(reason) => {
                log::warn!("Rejecting task {} attempt {}: {}", request.task_instance_id, request.attempt, reason);
                (AckStatus::Rejected, Some(reason))
            }
        };

        Some(Payload::TaskExecuteAck {
            task_instance_id: request.task_instance_id,
            attempt: request.attempt,
            status,
            worker_host: self.state.host.clone(),
            message,
        })
    }
}

struct TaskKillProcessor {
    state: Arc<WorkerState>,
}

#[async_trait]
impl CommandProcessor for TaskKillProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskKill
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::TaskKill { task_instance_id, attempt } = payload else {
            return None;
        };
        if !self.state.kill(&task_instance_id, attempt) {
            log::debug!("Kill for task {} attempt {} matched nothing", task_instance_id, attempt);
        }
        None
    }
}

struct UpdateWorkflowHostProcessor {
    state: Arc<WorkerState>,
}

#[async_trait]
impl CommandProcessor for UpdateWorkflowHostProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::UpdateWorkflowHost
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::UpdateWorkflowHost { workflow_instance_id, master_host } = payload else {
            return None;
        };
        match self.state.routes.lock().expect("Mutex poisoned").get_mut(&workflow_instance_id) {
            Some(route) => {
                log::info!("Results of workflow {} now go to {}", workflow_instance_id, master_host);
                route.master = master_host;
            }
            None => log::debug!("No attempt of workflow {} on this worker, host update dropped", workflow_instance_id),
        }
        None
    }
}

/// A worker process: accepts task attempts from masters while it has a free
/// execution slot, runs them and reports every terminal outcome back.
pub struct WorkerServer {
    state: Arc<WorkerState>,
    rpc_server: RpcServer,
    registry: Arc<dyn RegistryClient>,
    heartbeat: Option<JoinHandle<()>>,
}

impl WorkerServer {
    pub async fn start(
        config: &ClusterConfig,
        bind_ip: &str,
        registry: Arc<dyn RegistryClient>,
        clock: SharedClock,
        plugins: Arc<TaskPluginRegistry>,
    ) -> Result<Self> {
        let worker = &config.worker;
        let mut rpc_server = RpcServer::bind(&format!("{}:{}", bind_ip, worker.listen_port), config.rpc.serializer.build()).await?;
        let host = rpc_server.local_host().clone();

        let state = Arc::new(WorkerState {
            host: host.clone(),
            config: worker.clone(),
            plugins,
            rpc: RpcClient::new(&config.rpc),
            clock: clock.clone(),
            slots: Arc::new(Semaphore::new(worker.exec_threads.max(1) as usize)),
            pending: Arc::new(AtomicU32::new(0)),
            running: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        rpc_server.register_processor(Arc::new(TaskExecuteProcessor { state: state.clone() }));
        rpc_server.register_processor(Arc::new(TaskKillProcessor { state: state.clone() }));
        rpc_server.register_processor(Arc::new(UpdateWorkflowHostProcessor { state: state.clone() }));
        rpc_server.start();

        let reporter = NodeHeartbeat {
            exec_threads: worker.exec_threads,
            host_weight: worker.host_weight,
            max_cpu_load_avg: worker.max_cpu_load_avg,
            reserved_memory_mb: worker.reserved_memory_mb,
            pending_tasks: state.pending.clone(),
            ..NodeHeartbeat::new(NodeRole::Worker, host.clone(), clock)
        };
        let heartbeat = HeartbeatTask::new(registry.clone(), worker_path(&worker.group, &host), Arc::new(reporter), worker.heartbeat_interval);
        heartbeat.beat_once().await?;
        let heartbeat = Some(heartbeat.start(state.shutdown.clone()));

        log::info!("Worker started on {} in group '{}' with {} slots", host, worker.group, worker.exec_threads);
        Ok(Self { state, rpc_server, registry, heartbeat })
    }

    pub fn host(&self) -> &Host {
        &self.state.host
    }

    pub fn plugins(&self) -> &Arc<TaskPluginRegistry> {
        &self.state.plugins
    }

    /// Attempts accepted and not finished yet.
    pub fn pending_tasks(&self) -> u32 {
        self.state.pending.load(Ordering::Relaxed)
    }

    /// Attempts and workflows the worker still keeps bookkeeping for.
    pub fn tracked(&self) -> (usize, usize) {
        self.state.tracked()
    }

    /// Leaves the cluster and kills every running attempt.
    pub async fn shutdown(mut self) {
        self.state.shutdown.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        self.rpc_server.shutdown().await;
        self.state.rpc.close();
        self.registry.close().await;
        log::info!("Worker {} stopped", self.state.host);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::clock::MockClock;
    use crate::domain::config::RpcConfig;
    use crate::domain::model::definition::TaskKind;
    use crate::domain::utils::id::NodeCode;

    fn state(exec_threads: u32) -> WorkerState {
        WorkerState {
            host: Host::new("127.0.0.1:1234"),
            config: WorkerConfig { exec_threads, ..WorkerConfig::default() },
            plugins: Arc::new(TaskPluginRegistry::with_defaults()),
            rpc: RpcClient::new(&RpcConfig::default()),
            clock: MockClock::new(0).shared(),
            slots: Arc::new(Semaphore::new(exec_threads as usize)),
            pending: Arc::new(AtomicU32::new(0)),
            running: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn request(task: &str, attempt: u32) -> TaskExecuteRequest {
        TaskExecuteRequest {
            task_instance_id: TaskInstanceId::new(task),
            workflow_instance_id: WorkflowInstanceId::new("wf-1"),
            node_code: NodeCode::new(task),
            attempt,
            kind: TaskKind::Noop,
            params: BTreeMap::new(),
            master_host: Host::new("127.0.0.1:5678"),
        }
    }

    #[tokio::test]
    async fn admission_is_bounded_by_exec_threads() {
        let state = state(2);
        let first = state.admit(&request("a", 1));
        let second = state.admit(&request("b", 1));
        assert!(matches!(first, Admission::New(..)));
        assert!(matches!(second, Admission::New(..)));
        assert!(matches!(state.admit(&request("c", 1)), Admission::Overloaded));
        assert_eq!(state.pending.load(Ordering::Relaxed), 2);

        // A turned away attempt leaves no trace, so its redispatch is admitted.
        assert_eq!(state.tracked(), (2, 1));
        drop(first);
        assert!(matches!(state.admit(&request("c", 1)), Admission::New(..)));
    }

    #[tokio::test]
    async fn duplicates_and_stale_attempts_are_not_admitted() {
        let state = state(4);
        let _running = state.admit(&request("a", 2));
        assert!(matches!(state.admit(&request("a", 2)), Admission::Duplicate));
        assert!(matches!(state.admit(&request("a", 1)), Admission::Rejected(_)));
    }

    #[tokio::test]
    async fn releasing_the_last_attempt_drops_the_route() {
        let state = state(4);
        let _a = state.admit(&request("a", 1));
        let _b = state.admit(&request("b", 1));
        assert_eq!(state.master_of(&WorkflowInstanceId::new("wf-1")), Some(Host::new("127.0.0.1:5678")));

        state.release(&TaskInstanceId::new("a"), &WorkflowInstanceId::new("wf-1"), 1);
        assert_eq!(state.tracked(), (1, 1));
        state.release(&TaskInstanceId::new("b"), &WorkflowInstanceId::new("wf-1"), 1);
        assert_eq!(state.tracked(), (0, 0));
        assert_eq!(state.master_of(&WorkflowInstanceId::new("wf-1")), None);
    }
}
