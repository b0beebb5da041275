use std::time::Duration;

use crate::domain::model::definition::TimeoutStrategy;
use crate::domain::model::task_instance::{ExecutionStatus, TaskInstance, TaskState};
use crate::domain::rpc::protocol::AckStatus;
use crate::domain::utils::id::Host;
use crate::error::{DispatchError, EngineError};

/// Bounds for re-dispatching a task whose delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl DispatchPolicy {
    /// Exponential back-off for the n-th failure (1-based), capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Result of feeding one event into a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Stale or not applicable in the current state. Nothing changed.
    Ignored,
    /// Waiting in DISPATCH for a (new) worker.
    Queued,
    Dispatched,
    Running,
    Paused,
    /// Timeout with the `warn` strategy, reported once.
    TimeoutWarning,
    Terminal(TaskState),
}

/// Kill to deliver to the worker holding an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillOrder {
    pub host: Host,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub outcome: TaskOutcome,
    pub kill: Option<KillOrder>,
}

impl Transition {
    fn to(outcome: TaskOutcome) -> Self {
        Self { outcome, kill: None }
    }

    fn ignored() -> Self {
        Self::to(TaskOutcome::Ignored)
    }

    fn with_kill(mut self, kill: Option<KillOrder>) -> Self {
        self.kill = kill;
        self
    }

    pub fn is_ignored(&self) -> bool {
        self.outcome == TaskOutcome::Ignored
    }
}

/// Lifecycle state machine of one task instance.
///
/// Pure: no I/O. Every worker-originated event carries the attempt id it
/// belongs to and is dropped unless it matches the current attempt.
#[derive(Debug, Clone)]
pub struct TaskRunnable {
    task: TaskInstance,
}

impl TaskRunnable {
    pub fn new(task: TaskInstance) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &TaskInstance {
        &self.task
    }

    pub fn into_task(self) -> TaskInstance {
        self.task
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    pub fn is_terminal(&self) -> bool {
        self.task.is_terminal()
    }

    fn current_kill_order(&self) -> Option<KillOrder> {
        match (self.task.state.is_on_worker(), &self.task.host) {
            (true, Some(host)) => Some(KillOrder { host: host.clone(), attempt: self.task.attempt }),
            _ => None,
        }
    }

    /// Moves the task back to DISPATCH under a fresh attempt id.
    fn requeue(&mut self, not_before: Option<i64>) -> TaskOutcome {
        self.task.attempt += 1;
        self.task.state = TaskState::Dispatch;
        self.task.host = None;
        self.task.dispatched_attempt = None;
        self.task.dispatch_time = None;
        self.task.start_time = None;
        self.task.timeout_warned = false;
        self.task.retry_not_before = not_before;
        TaskOutcome::Queued
    }

    fn finish(&mut self, state: TaskState, now: i64) -> TaskOutcome {
        self.task.state = state;
        self.task.end_time = Some(now);
        TaskOutcome::Terminal(state)
    }

    fn retries_left(&self) -> bool {
        self.task.retry_times < self.task.max_retry_times
    }

    fn retry_or_fail(&mut self, now: i64) -> TaskOutcome {
        if self.retries_left() {
            self.task.retry_times += 1;
            let not_before = now + self.task.retry_interval.as_millis() as i64;
            log::info!("Task {} retry {}/{}", self.task.id, self.task.retry_times, self.task.max_retry_times);
            self.requeue(Some(not_before))
        } else {
            self.finish(TaskState::Failed, now)
        }
    }

    /// CREATED or PAUSED -> DISPATCH with a new attempt id.
    pub fn start(&mut self, dependencies_satisfied: bool) -> Result<TaskOutcome, EngineError> {
        if !dependencies_satisfied {
            return Err(EngineError::DependenciesNotSatisfied(self.task.node_code.clone()));
        }
        match self.task.state {
            TaskState::Created | TaskState::Paused => Ok(self.requeue(None)),
            from => Err(EngineError::InvalidTransition { task: self.task.id.clone(), from, operation: "start" }),
        }
    }

    pub fn ready_to_dispatch(&self, now: i64) -> bool {
        self.task.state == TaskState::Dispatch && self.task.retry_not_before.is_none_or(|not_before| now >= not_before)
    }

    /// DISPATCH -> DISPATCHED. Each attempt is handed to a worker at most once.
    pub fn dispatch(&mut self, host: Host, now: i64) -> Result<TaskOutcome, DispatchError> {
        if self.task.dispatched_attempt == Some(self.task.attempt) {
            return Err(DispatchError::AlreadyDispatched { task: self.task.id.clone(), attempt: self.task.attempt });
        }
        if self.task.state != TaskState::Dispatch {
            return Err(DispatchError::NotDispatchable { task: self.task.id.clone(), state: self.task.state });
        }

        self.task.state = TaskState::Dispatched;
        self.task.host = Some(host);
        self.task.dispatched_attempt = Some(self.task.attempt);
        self.task.dispatch_time = Some(now);
        self.task.retry_not_before = None;
        Ok(TaskOutcome::Dispatched)
    }

    /// An overloaded worker sends the task back to DISPATCH after one back-off
    /// base, without counting against the dispatch retry budget.
    pub fn on_ack(&mut self, attempt: u32, status: AckStatus, now: i64, policy: &DispatchPolicy) -> Transition {
        if attempt != self.task.attempt || self.task.state != TaskState::Dispatched {
            return Transition::ignored();
        }
        match status {
            AckStatus::Accepted => {}
            AckStatus::Rejected => return self.on_dispatch_failed(attempt, now, policy),
            AckStatus::Overloaded => {
                log::debug!("Worker {:?} is full, task {} waits for a free slot", self.task.host, self.task.id);
                let not_before = now + policy.backoff_base.as_millis() as i64;
                return Transition::to(self.requeue(Some(not_before)));
            }
        }
        self.task.state = TaskState::Running;
        self.task.start_time = Some(now);
        self.task.dispatch_failures = 0;
        Transition::to(TaskOutcome::Running)
    }

    /// Terminal report of a worker. A result may overtake its ack.
    pub fn on_result(&mut self, attempt: u32, status: ExecutionStatus, now: i64) -> Transition {
        if attempt != self.task.attempt || !self.task.state.is_on_worker() {
            return Transition::ignored();
        }
        if self.task.start_time.is_none() {
            self.task.start_time = Some(now);
        }
        let outcome = match status {
            ExecutionStatus::Success => self.finish(TaskState::Succeeded, now),
            ExecutionStatus::Failure => self.retry_or_fail(now),
            ExecutionStatus::Killed => self.finish(TaskState::Killed, now),
        };
        Transition::to(outcome)
    }

    /// Delivery of the current attempt failed (connection, ack timeout or
    /// rejection). Retries under a new attempt with back-off until the
    /// dispatch retry budget is spent.
    pub fn on_dispatch_failed(&mut self, attempt: u32, now: i64, policy: &DispatchPolicy) -> Transition {
        if attempt != self.task.attempt || !matches!(self.task.state, TaskState::Dispatch | TaskState::Dispatched) {
            return Transition::ignored();
        }
        let kill = self.current_kill_order();
        self.task.dispatch_failures += 1;

        let outcome = if self.task.dispatch_failures > policy.max_retries {
            log::warn!("Task {} failed after {} dispatch failures", self.task.id, self.task.dispatch_failures);
            self.finish(TaskState::Failed, now)
        } else {
            let backoff = policy.backoff(self.task.dispatch_failures);
            self.requeue(Some(now + backoff.as_millis() as i64))
        };
        Transition::to(outcome).with_kill(kill)
    }

    /// Safety net for an ack that never resolved.
    pub fn check_ack_timeout(&mut self, now: i64, ack_timeout: Duration, policy: &DispatchPolicy) -> Transition {
        match (self.task.state, self.task.dispatch_time) {
            (TaskState::Dispatched, Some(dispatched)) if now - dispatched >= ack_timeout.as_millis() as i64 => {
                self.on_dispatch_failed(self.task.attempt, now, policy)
            }
            _ => Transition::ignored(),
        }
    }

    pub fn check_timeout(&mut self, now: i64) -> Transition {
        let (Some(timeout), Some(start)) = (self.task.timeout, self.task.start_time) else {
            return Transition::ignored();
        };
        if self.task.state != TaskState::Running || now - start < timeout.timeout.as_millis() as i64 {
            return Transition::ignored();
        }

        match timeout.strategy {
            TimeoutStrategy::Warn if self.task.timeout_warned => Transition::ignored(),
            TimeoutStrategy::Warn => {
                self.task.timeout_warned = true;
                Transition::to(TaskOutcome::TimeoutWarning)
            }
            TimeoutStrategy::Fail => {
                let kill = self.current_kill_order();
                Transition::to(self.finish(TaskState::Failed, now)).with_kill(kill)
            }
            TimeoutStrategy::Retry => {
                let kill = self.current_kill_order();
                Transition::to(self.retry_or_fail(now)).with_kill(kill)
            }
        }
    }

    /// The worker holding this task is gone.
    pub fn failover(&mut self, lost_host: &Host, now: i64) -> Transition {
        if !self.task.state.is_on_worker() || self.task.host.as_ref() != Some(lost_host) {
            return Transition::ignored();
        }
        let outcome = if self.task.resumable { self.requeue(None) } else { self.finish(TaskState::Failed, now) };
        Transition::to(outcome)
    }

    /// Re-dispatches an attempt whose ack was lost with a previous master.
    pub fn reclaim(&mut self) -> Transition {
        if self.task.state != TaskState::Dispatched {
            return Transition::ignored();
        }
        let kill = self.current_kill_order();
        Transition::to(self.requeue(None)).with_kill(kill)
    }

    /// Never preempts: only tasks no worker holds yet are paused.
    pub fn pause(&mut self) -> Transition {
        match self.task.state {
            TaskState::Created | TaskState::Dispatch => {
                self.task.state = TaskState::Paused;
                self.task.retry_not_before = None;
                Transition::to(TaskOutcome::Paused)
            }
            _ => Transition::ignored(),
        }
    }

    /// Idempotent. A terminal task is left untouched.
    pub fn kill(&mut self, now: i64) -> Transition {
        if self.task.is_terminal() {
            return Transition::ignored();
        }
        let kill = self.current_kill_order();
        Transition::to(self.finish(TaskState::Killed, now)).with_kill(kill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::definition::{TaskDefinition, TaskKind, TimeoutStrategy};
    use crate::domain::utils::id::WorkflowInstanceId;

    const POLICY: DispatchPolicy =
        DispatchPolicy { max_retries: 2, backoff_base: Duration::from_millis(100), backoff_max: Duration::from_millis(250) };

    fn runnable(definition: TaskDefinition) -> TaskRunnable {
        TaskRunnable::new(TaskInstance::new(WorkflowInstanceId::new("wf-1"), &definition))
    }

    fn running(definition: TaskDefinition) -> TaskRunnable {
        let mut task = runnable(definition);
        task.start(true).unwrap();
        task.dispatch(Host::new("w1:1"), 0).unwrap();
        let attempt = task.task().attempt;
        assert_eq!(task.on_ack(attempt, AckStatus::Accepted, 10, &POLICY).outcome, TaskOutcome::Running);
        task
    }

    #[test]
    fn happy_path_moves_through_every_state() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        assert_eq!(task.state(), TaskState::Created);

        assert_eq!(task.start(true).unwrap(), TaskOutcome::Queued);
        assert_eq!(task.task().attempt, 1);
        assert!(task.ready_to_dispatch(0));

        assert_eq!(task.dispatch(Host::new("w1:1"), 5).unwrap(), TaskOutcome::Dispatched);
        assert_eq!(task.on_ack(1, AckStatus::Accepted, 6, &POLICY).outcome, TaskOutcome::Running);
        assert_eq!(task.on_result(1, ExecutionStatus::Success, 9).outcome, TaskOutcome::Terminal(TaskState::Succeeded));
        assert_eq!(task.task().end_time, Some(9));
    }

    #[test]
    fn start_requires_satisfied_dependencies() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        assert!(matches!(task.start(false), Err(EngineError::DependenciesNotSatisfied(_))));
        assert_eq!(task.state(), TaskState::Created);
    }

    #[test]
    fn second_dispatch_of_same_attempt_is_rejected() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        task.start(true).unwrap();
        task.dispatch(Host::new("w1:1"), 0).unwrap();

        let err = task.dispatch(Host::new("w2:1"), 1).unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyDispatched { attempt: 1, .. }));
        assert_eq!(task.task().host, Some(Host::new("w1:1")));
    }

    #[test]
    fn stale_result_is_ignored() {
        let mut task = running(TaskDefinition::new("a", TaskKind::Noop).with_retries(1, Duration::ZERO));
        task.on_result(1, ExecutionStatus::Failure, 20);
        assert_eq!(task.task().attempt, 2);
        assert_eq!(task.state(), TaskState::Dispatch);

        let before = task.task().clone();
        assert!(task.on_result(1, ExecutionStatus::Success, 30).is_ignored());
        assert!(task.on_ack(1, AckStatus::Accepted, 30, &POLICY).is_ignored());
        assert_eq!(task.task(), &before);
    }

    #[test]
    fn failure_retries_after_interval_then_fails() {
        let mut task = running(TaskDefinition::new("a", TaskKind::Noop).with_retries(1, Duration::from_millis(500)));

        assert_eq!(task.on_result(1, ExecutionStatus::Failure, 100).outcome, TaskOutcome::Queued);
        assert!(!task.ready_to_dispatch(599));
        assert!(task.ready_to_dispatch(600));

        task.dispatch(Host::new("w2:1"), 600).unwrap();
        task.on_ack(2, AckStatus::Accepted, 601, &POLICY);
        assert_eq!(task.on_result(2, ExecutionStatus::Failure, 700).outcome, TaskOutcome::Terminal(TaskState::Failed));
        assert_eq!(task.task().retry_times, 1);
    }

    #[test]
    fn dispatch_failures_back_off_then_fail() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        task.start(true).unwrap();

        for (round, wait) in [(1u32, 100i64), (2, 200)] {
            let now = task.task().retry_not_before.unwrap_or(0);
            task.dispatch(Host::new("w1:1"), now).unwrap();
            let transition = task.on_dispatch_failed(round, now, &POLICY);
            assert_eq!(transition.outcome, TaskOutcome::Queued);
            assert_eq!(transition.kill, Some(KillOrder { host: Host::new("w1:1"), attempt: round }));
            assert_eq!(task.task().retry_not_before, Some(now + wait));
        }

        let now = task.task().retry_not_before.unwrap();
        task.dispatch(Host::new("w1:1"), now).unwrap();
        assert_eq!(task.on_dispatch_failed(3, now, &POLICY).outcome, TaskOutcome::Terminal(TaskState::Failed));
        assert_eq!(POLICY.backoff(10), Duration::from_millis(250));
    }

    #[test]
    fn rejected_ack_counts_as_dispatch_failure() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        task.start(true).unwrap();
        task.dispatch(Host::new("w1:1"), 0).unwrap();

        assert_eq!(task.on_ack(1, AckStatus::Rejected, 1, &POLICY).outcome, TaskOutcome::Queued);
        assert_eq!(task.task().dispatch_failures, 1);
        assert_eq!(task.task().attempt, 2);
    }

    #[test]
    fn overloaded_ack_waits_without_spending_retries() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        task.start(true).unwrap();

        for round in 0..5 {
            let now = round * 1_000;
            task.dispatch(Host::new("w1:1"), now).unwrap();
            let attempt = task.task().attempt;
            assert_eq!(task.on_ack(attempt, AckStatus::Overloaded, now, &POLICY).outcome, TaskOutcome::Queued);
            assert_eq!(task.task().dispatch_failures, 0);
            assert_eq!(task.task().host, None);
            assert!(!task.ready_to_dispatch(now + 99));
            assert!(task.ready_to_dispatch(now + 100));
        }

        task.dispatch(Host::new("w1:1"), 10_000).unwrap();
        let attempt = task.task().attempt;
        assert_eq!(task.on_ack(attempt, AckStatus::Accepted, 10_001, &POLICY).outcome, TaskOutcome::Running);
    }

    #[test]
    fn ack_timeout_redispatches() {
        let mut task = runnable(TaskDefinition::new("a", TaskKind::Noop));
        task.start(true).unwrap();
        task.dispatch(Host::new("w1:1"), 0).unwrap();

        assert!(task.check_ack_timeout(999, Duration::from_secs(1), &POLICY).is_ignored());
        assert_eq!(task.check_ack_timeout(1000, Duration::from_secs(1), &POLICY).outcome, TaskOutcome::Queued);
    }

    #[test]
    fn timeout_strategies() {
        let def = |strategy| TaskDefinition::new("a", TaskKind::Sleep).with_timeout(Duration::from_millis(100), strategy);

        let mut warn = running(def(TimeoutStrategy::Warn));
        assert!(warn.check_timeout(50).is_ignored());
        assert_eq!(warn.check_timeout(200).outcome, TaskOutcome::TimeoutWarning);
        assert!(warn.check_timeout(300).is_ignored());
        assert_eq!(warn.state(), TaskState::Running);

        let mut fail = running(def(TimeoutStrategy::Fail));
        let transition = fail.check_timeout(200);
        assert_eq!(transition.outcome, TaskOutcome::Terminal(TaskState::Failed));
        assert_eq!(transition.kill, Some(KillOrder { host: Host::new("w1:1"), attempt: 1 }));

        let mut retry = running(def(TimeoutStrategy::Retry).with_retries(1, Duration::ZERO));
        let transition = retry.check_timeout(200);
        assert_eq!(transition.outcome, TaskOutcome::Queued);
        assert!(transition.kill.is_some());
        assert_eq!(retry.task().attempt, 2);
    }

    #[test]
    fn failover_depends_on_resumable_flag() {
        let mut resumable = running(TaskDefinition::new("a", TaskKind::Noop));
        assert!(resumable.failover(&Host::new("other:1"), 20).is_ignored());
        assert_eq!(resumable.failover(&Host::new("w1:1"), 20).outcome, TaskOutcome::Queued);
        assert_eq!(resumable.task().host, None);

        let mut pinned = running(TaskDefinition { resumable: false, ..TaskDefinition::new("b", TaskKind::Noop) });
        assert_eq!(pinned.failover(&Host::new("w1:1"), 20).outcome, TaskOutcome::Terminal(TaskState::Failed));
    }

    #[test]
    fn pause_never_preempts() {
        let mut queued = runnable(TaskDefinition::new("a", TaskKind::Noop));
        queued.start(true).unwrap();
        assert_eq!(queued.pause().outcome, TaskOutcome::Paused);
        assert_eq!(queued.start(true).unwrap(), TaskOutcome::Queued);

        let mut busy = running(TaskDefinition::new("b", TaskKind::Noop));
        assert!(busy.pause().is_ignored());
        assert_eq!(busy.state(), TaskState::Running);
    }

    #[test]
    fn kill_on_succeeded_task_is_a_no_op() {
        let mut task = running(TaskDefinition::new("a", TaskKind::Noop));
        task.on_result(1, ExecutionStatus::Success, 20);

        let transition = task.kill(30);
        assert!(transition.is_ignored());
        assert_eq!(transition.kill, None);
        assert_eq!(task.state(), TaskState::Succeeded);
    }

    #[test]
    fn kill_of_running_task_targets_its_worker_once() {
        let mut task = running(TaskDefinition::new("a", TaskKind::Noop));

        let first = task.kill(30);
        assert_eq!(first.outcome, TaskOutcome::Terminal(TaskState::Killed));
        assert_eq!(first.kill, Some(KillOrder { host: Host::new("w1:1"), attempt: 1 }));
        assert!(task.kill(31).is_ignored());
        assert!(task.on_result(1, ExecutionStatus::Success, 32).is_ignored());
    }
}
