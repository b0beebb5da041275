use serde::{Deserialize, Serialize};

use crate::domain::utils::id::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Master,
    Worker,
    AlertServer,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
            NodeRole::AlertServer => "alert-server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Normal,
    /// Overloaded, must not receive new work.
    Busy,
}

/// Payload of a node's ephemeral registry entry, rewritten on every beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInfo {
    pub role: NodeRole,
    pub host: Host,
    pub startup_time: i64,
    pub report_time: i64,
    pub cpu_load_avg: f64,
    pub available_memory_mb: u64,
    pub exec_threads: u32,
    pub host_weight: u32,
    pub pending_tasks: u32,
    pub process_id: u32,
    pub server_status: ServerStatus,
}

/// A live worker as seen by the dispatcher for a single dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCandidate {
    pub host: Host,
    pub group: String,
    pub heartbeat: HeartbeatInfo,
}

impl WorkerCandidate {
    pub fn weight(&self) -> u32 {
        self.heartbeat.host_weight
    }

    pub fn is_busy(&self) -> bool {
        self.heartbeat.server_status == ServerStatus::Busy
    }
}
