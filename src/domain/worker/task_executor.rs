use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::domain::model::definition::TaskKind;
use crate::domain::model::task_instance::ExecutionStatus;
use crate::domain::rpc::protocol::TaskExecuteRequest;
use crate::domain::utils::id::{NodeCode, TaskInstanceId, WorkflowInstanceId};

/// What an executor gets to see of a dispatched task.
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub task_instance_id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub node_code: NodeCode,
    pub attempt: u32,
    pub params: BTreeMap<String, String>,
}

impl From<&TaskExecuteRequest> for TaskExecutionContext {
    fn from(request: &TaskExecuteRequest) -> Self {
        Self {
            task_instance_id: request.task_instance_id.clone(),
            workflow_instance_id: request.workflow_instance_id.clone(),
            node_code: request.node_code.clone(),
            attempt: request.attempt,
            params: request.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self { status: ExecutionStatus::Success, exit_code: Some(0), message: None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { status: ExecutionStatus::Failure, exit_code: None, message: Some(message.into()) }
    }

    pub fn killed() -> Self {
        Self { status: ExecutionStatus::Killed, exit_code: None, message: Some("killed".to_string()) }
    }
}

/// One parameter an executor reads from the task params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskParameter {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// Runs one kind of task on a worker. `cancel` fires when the master kills
/// the attempt, the executor then stops and reports `Killed`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn parameters(&self) -> &'static [TaskParameter] {
        &[]
    }

    async fn execute(&self, ctx: &TaskExecutionContext, cancel: CancellationToken) -> ExecutionOutcome;
}

/// Runs `params["command"]` with `sh -c`.
#[derive(Debug, Default)]
pub struct ShellExecutor;

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Shell
    }

    fn parameters(&self) -> &'static [TaskParameter] {
        &[TaskParameter { name: "command", required: true, description: "script passed to `sh -c`, other params are exported as DWS_<NAME>" }]
    }

    async fn execute(&self, ctx: &TaskExecutionContext, cancel: CancellationToken) -> ExecutionOutcome {
        let Some(command) = ctx.params.get("command") else {
            return ExecutionOutcome::failure("missing parameter 'command'");
        };

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(ctx.params.iter().filter(|(k, _)| k.as_str() != "command").map(|(k, v)| (format!("DWS_{}", k.to_ascii_uppercase()), v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return ExecutionOutcome::failure(format!("spawn failed: {}", e)),
        };

        tokio::select! {
            _ = cancel.cancelled() => ExecutionOutcome::killed(),
            output = child.wait_with_output() => match output {
                Ok(output) if output.status.success() => ExecutionOutcome::success(),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    ExecutionOutcome {
                        status: ExecutionStatus::Failure,
                        exit_code: output.status.code(),
                        message: (!stderr.is_empty()).then_some(stderr),
                    }
                }
                Err(e) => ExecutionOutcome::failure(e.to_string()),
            },
        }
    }
}

/// Sleeps `params["duration_ms"]`, then succeeds unless `params["fail"]`
/// is "true".
#[derive(Debug, Default)]
pub struct SleepExecutor;

#[async_trait]
impl TaskExecutor for SleepExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Sleep
    }

    fn parameters(&self) -> &'static [TaskParameter] {
        &[
            TaskParameter { name: "duration_ms", required: false, description: "how long to sleep, 0 if absent" },
            TaskParameter { name: "fail", required: false, description: "\"true\" makes the task fail after sleeping" },
        ]
    }

    async fn execute(&self, ctx: &TaskExecutionContext, cancel: CancellationToken) -> ExecutionOutcome {
        let millis = match ctx.params.get("duration_ms").map(|v| v.parse::<u64>()) {
            None => 0,
            Some(Ok(millis)) => millis,
            Some(Err(e)) => return ExecutionOutcome::failure(format!("invalid 'duration_ms': {}", e)),
        };

        tokio::select! {
            _ = cancel.cancelled() => ExecutionOutcome::killed(),
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                if ctx.params.get("fail").is_some_and(|v| v == "true") {
                    ExecutionOutcome { exit_code: Some(1), ..ExecutionOutcome::failure("failed on request") }
                } else {
                    ExecutionOutcome::success()
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Noop
    }

    async fn execute(&self, _ctx: &TaskExecutionContext, _cancel: CancellationToken) -> ExecutionOutcome {
        ExecutionOutcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(params: &[(&str, &str)]) -> TaskExecutionContext {
        TaskExecutionContext {
            task_instance_id: TaskInstanceId::new("t"),
            workflow_instance_id: WorkflowInstanceId::new("w"),
            node_code: NodeCode::new("n"),
            attempt: 1,
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn shell_reports_exit_code() {
        let ok = ShellExecutor.execute(&ctx(&[("command", "true")]), CancellationToken::new()).await;
        assert_eq!(ok.status, ExecutionStatus::Success);

        let failed = ShellExecutor.execute(&ctx(&[("command", "echo boom >&2; exit 3")]), CancellationToken::new()).await;
        assert_eq!(failed.status, ExecutionStatus::Failure);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn shell_without_command_fails() {
        let outcome = ShellExecutor.execute(&ctx(&[]), CancellationToken::new()).await;
        assert_eq!(outcome.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = SleepExecutor.execute(&ctx(&[("duration_ms", "60000")]), cancel).await;
        assert_eq!(outcome.status, ExecutionStatus::Killed);
    }

    #[tokio::test]
    async fn sleep_can_fail_on_request() {
        let outcome = SleepExecutor.execute(&ctx(&[("duration_ms", "1"), ("fail", "true")]), CancellationToken::new()).await;
        assert_eq!(outcome.status, ExecutionStatus::Failure);
        assert_eq!(outcome.exit_code, Some(1));
    }
}
