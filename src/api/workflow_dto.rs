use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Workflow definition as submitted by a user (JSON file or API payload).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinitionDto {
    pub code: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,

    /// "continue" or "end"
    #[serde(default)]
    pub failure_strategy: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,

    pub tasks: Vec<TaskDto>,
    #[serde(default)]
    pub relations: Vec<TaskRelationDto>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    /// "shell", "sleep" or "noop"
    pub typ: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub timeout: Option<TimeoutDto>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub worker_group: Option<String>,

    /// Whether the task may be re-dispatched when its worker dies.
    #[serde(default)]
    pub resumable: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutDto {
    pub timeout_ms: u64,
    /// "warn", "fail" or "retry"
    pub strategy: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskRelationDto {
    pub pre: String,
    pub post: String,
    /// "on_success" (default), "on_failure" or "always"
    #[serde(default)]
    pub policy: Option<String>,
}

fn default_version() -> u32 {
    1
}
