use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::workflow_dto::{TaskDto, TaskRelationDto, WorkflowDefinitionDto};
use crate::domain::utils::id::{NodeCode, WorkflowCode};
use crate::error::{ConversionError, Error};

pub const DEFAULT_WORKER_GROUP: &str = "default";

/// Closed set of task types the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Shell,
    Sleep,
    Noop,
}

impl FromStr for TaskKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(TaskKind::Shell),
            "sleep" => Ok(TaskKind::Sleep),
            "noop" => Ok(TaskKind::Noop),
            _ => Err(ConversionError::UnknownTaskKind(s.to_string())),
        }
    }
}

/// What happens to the rest of the workflow when a required node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailureStrategy {
    /// Keep running every branch that is still reachable.
    Continue,
    /// Fail fast: kill everything that is still running.
    #[default]
    End,
}

impl FromStr for FailureStrategy {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(FailureStrategy::Continue),
            "end" => Ok(FailureStrategy::End),
            _ => Err(ConversionError::UnknownFailureStrategy(s.to_string())),
        }
    }
}

/// Branch policy of a DAG edge `pre -> post`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgePolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl FromStr for EdgePolicy {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on_success" | "success" => Ok(EdgePolicy::OnSuccess),
            "on_failure" | "failure" => Ok(EdgePolicy::OnFailure),
            "always" => Ok(EdgePolicy::Always),
            _ => Err(ConversionError::UnknownEdgePolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutStrategy {
    /// Send an alert and let the task keep running.
    Warn,
    /// Kill the task and fail it without consuming retries.
    Fail,
    /// Kill the task and treat it like a failed attempt.
    Retry,
}

impl FromStr for TimeoutStrategy {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(TimeoutStrategy::Warn),
            "fail" | "failed" => Ok(TimeoutStrategy::Fail),
            "retry" => Ok(TimeoutStrategy::Retry),
            _ => Err(ConversionError::UnknownTimeoutStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub timeout: Duration,
    pub strategy: TimeoutStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl FromStr for Priority {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Priority::Lowest),
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "highest" => Ok(Priority::Highest),
            _ => Err(ConversionError::UnknownPriority(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub code: NodeCode,
    pub name: String,
    pub kind: TaskKind,
    pub params: BTreeMap<String, String>,
    pub retry_times: u32,
    pub retry_interval: Duration,
    pub timeout: Option<TimeoutPolicy>,
    pub priority: Priority,
    pub worker_group: String,
    pub resumable: bool,
}

impl TaskDefinition {
    /// Minimal definition, mostly used to assemble DAGs in code.
    pub fn new(code: impl Into<String>, kind: TaskKind) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code: NodeCode::new(code),
            kind,
            params: BTreeMap::new(),
            retry_times: 0,
            retry_interval: Duration::ZERO,
            timeout: None,
            priority: Priority::Medium,
            worker_group: DEFAULT_WORKER_GROUP.to_string(),
            resumable: true,
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_retries(mut self, retry_times: u32, retry_interval: Duration) -> Self {
        self.retry_times = retry_times;
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, strategy: TimeoutStrategy) -> Self {
        self.timeout = Some(TimeoutPolicy { timeout, strategy });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRelation {
    pub pre: NodeCode,
    pub post: NodeCode,
    pub policy: EdgePolicy,
}

impl TaskRelation {
    pub fn new(pre: &str, post: &str) -> Self {
        Self { pre: NodeCode::new(pre), post: NodeCode::new(post), policy: EdgePolicy::OnSuccess }
    }

    pub fn with_policy(pre: &str, post: &str, policy: EdgePolicy) -> Self {
        Self { pre: NodeCode::new(pre), post: NodeCode::new(post), policy }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub code: WorkflowCode,
    pub version: u32,
    pub name: String,
    pub failure_strategy: FailureStrategy,
    pub priority: Priority,
    pub tasks: Vec<TaskDefinition>,
    pub relations: Vec<TaskRelation>,
}

impl WorkflowDefinition {
    pub fn new(code: &str, tasks: Vec<TaskDefinition>, relations: Vec<TaskRelation>) -> Self {
        Self {
            code: WorkflowCode::new(code),
            version: 1,
            name: code.to_string(),
            failure_strategy: FailureStrategy::default(),
            priority: Priority::default(),
            tasks,
            relations,
        }
    }

    pub fn with_failure_strategy(mut self, failure_strategy: FailureStrategy) -> Self {
        self.failure_strategy = failure_strategy;
        self
    }

    pub fn task(&self, code: &NodeCode) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|task| &task.code == code)
    }
}

impl TryFrom<WorkflowDefinitionDto> for WorkflowDefinition {
    type Error = Error;

    fn try_from(dto: WorkflowDefinitionDto) -> Result<Self, Self::Error> {
        if dto.code.trim().is_empty() {
            return Err(Error::ModelConstructionError("workflow code must not be empty".to_string()));
        }

        let failure_strategy = match dto.failure_strategy.as_deref() {
            Some(s) => FailureStrategy::from_str(s)?,
            None => FailureStrategy::default(),
        };
        let priority = parse_priority(dto.priority.as_deref())?;

        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(dto.tasks.len());
        for task_dto in dto.tasks {
            if !seen.insert(task_dto.code.clone()) {
                return Err(Error::ModelConstructionError(format!(
                    "task code '{}' is defined more than once in workflow '{}'",
                    task_dto.code, dto.code
                )));
            }
            tasks.push(TaskDefinition::try_from(task_dto)?);
        }

        let relations = dto.relations.into_iter().map(TaskRelation::try_from).collect::<Result<Vec<_>, _>>()?;

        Ok(WorkflowDefinition {
            name: dto.name.unwrap_or_else(|| dto.code.clone()),
            code: WorkflowCode::new(dto.code),
            version: dto.version,
            failure_strategy,
            priority,
            tasks,
            relations,
        })
    }
}

impl TryFrom<TaskDto> for TaskDefinition {
    type Error = Error;

    fn try_from(dto: TaskDto) -> Result<Self, Self::Error> {
        let timeout = match dto.timeout {
            Some(timeout_dto) => Some(TimeoutPolicy {
                timeout: Duration::from_millis(timeout_dto.timeout_ms),
                strategy: TimeoutStrategy::from_str(&timeout_dto.strategy)?,
            }),
            None => None,
        };

        Ok(TaskDefinition {
            name: dto.name.unwrap_or_else(|| dto.code.clone()),
            code: NodeCode::new(dto.code),
            kind: TaskKind::from_str(&dto.typ)?,
            params: dto.params,
            retry_times: dto.retry_times,
            retry_interval: Duration::from_millis(dto.retry_interval_ms),
            timeout,
            priority: parse_priority(dto.priority.as_deref())?,
            worker_group: dto.worker_group.unwrap_or_else(|| DEFAULT_WORKER_GROUP.to_string()),
            resumable: dto.resumable.unwrap_or(true),
        })
    }
}

impl TryFrom<TaskRelationDto> for TaskRelation {
    type Error = Error;

    fn try_from(dto: TaskRelationDto) -> Result<Self, Self::Error> {
        let policy = match dto.policy.as_deref() {
            Some(s) => EdgePolicy::from_str(s)?,
            None => EdgePolicy::OnSuccess,
        };
        Ok(TaskRelation { pre: NodeCode::new(dto.pre), post: NodeCode::new(dto.post), policy })
    }
}

fn parse_priority(value: Option<&str>) -> Result<Priority, ConversionError> {
    match value {
        Some(s) => Priority::from_str(s),
        None => Ok(Priority::default()),
    }
}
