use crate::domain::model::cluster_node::NodeRole;
use crate::domain::utils::id::Host;

pub const NODES_ROOT: &str = "/nodes";
pub const MASTER_PREFIX: &str = "/nodes/master";
pub const WORKER_PREFIX: &str = "/nodes/worker";
pub const ALERT_SERVER_PREFIX: &str = "/nodes/alert-server";
pub const FAILOVER_LOCK_PREFIX: &str = "/lock/failover";
pub const FAILOVER_FINISHED_PREFIX: &str = "/nodes/failover-finished";

pub fn role_prefix(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Master => MASTER_PREFIX,
        NodeRole::Worker => WORKER_PREFIX,
        NodeRole::AlertServer => ALERT_SERVER_PREFIX,
    }
}

pub fn master_path(host: &Host) -> String {
    format!("{}/{}", MASTER_PREFIX, host)
}

pub fn worker_path(group: &str, host: &Host) -> String {
    format!("{}/{}/{}", WORKER_PREFIX, group, host)
}

pub fn alert_server_path(host: &Host) -> String {
    format!("{}/{}", ALERT_SERVER_PREFIX, host)
}

pub fn failover_lock_path(role: NodeRole, host: &Host) -> String {
    format!("{}/{}/{}", FAILOVER_LOCK_PREFIX, role.as_str(), host)
}

/// Marker written once the failover of one incarnation of a node is done.
/// A restarted node gets a new startup time and therefore a new marker.
pub fn failover_finished_path(role: NodeRole, host: &Host, startup_time: i64) -> String {
    format!("{}/{}/{}@{}", FAILOVER_FINISHED_PREFIX, role.as_str(), host, startup_time)
}

/// Last path segment, which is the host for every node path.
pub fn host_of(path: &str) -> Host {
    Host::new(path.rsplit('/').next().unwrap_or(path))
}

/// Worker group of a `/nodes/worker/<group>/<host>` path.
pub fn worker_group_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(WORKER_PREFIX)?.strip_prefix('/')?;
    let (group, host) = rest.split_once('/')?;
    (!host.is_empty() && !host.contains('/')).then_some(group)
}
