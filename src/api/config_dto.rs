use serde::Deserialize;

/// Root of the cluster configuration file. Every field is optional, missing
/// values fall back to the defaults of `ClusterConfig`.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigDto {
    #[serde(default)]
    pub rpc: Option<RpcConfigDto>,
    #[serde(default)]
    pub registry: Option<RegistryConfigDto>,
    #[serde(default)]
    pub master: Option<MasterConfigDto>,
    #[serde(default)]
    pub worker: Option<WorkerConfigDto>,
    #[serde(default)]
    pub alert: Option<AlertConfigDto>,
    #[serde(default)]
    pub logging: Option<LoggingConfigDto>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfigDto {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    /// "bincode" or "json"
    pub serializer: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfigDto {
    pub session_timeout_ms: Option<u64>,
    pub reaper_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MasterConfigDto {
    pub listen_port: Option<u16>,
    /// "round_robin", "random", "weighted_random" or "lower_weight"
    pub host_selector: Option<String>,
    pub dispatch_ack_timeout_ms: Option<u64>,
    pub max_dispatch_retries: Option<u32>,
    pub dispatch_backoff_base_ms: Option<u64>,
    pub dispatch_backoff_max_ms: Option<u64>,
    pub state_check_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub failover_interval_ms: Option<u64>,
    pub max_cpu_load_avg: Option<f64>,
    pub reserved_memory_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfigDto {
    pub listen_port: Option<u16>,
    pub group: Option<String>,
    pub exec_threads: Option<u32>,
    pub host_weight: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub result_retry_interval_ms: Option<u64>,
    pub max_result_retries: Option<u32>,
    pub max_cpu_load_avg: Option<f64>,
    pub reserved_memory_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfigDto {
    pub enabled: Option<bool>,
    pub listen_port: Option<u16>,
    pub send_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfigDto {
    pub level: Option<String>,
    pub dir: Option<String>,
    pub file: Option<String>,
    pub stats_file: Option<String>,
}
