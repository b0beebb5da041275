use std::time::Duration;

use crate::api::config_dto::{
    AlertConfigDto, ClusterConfigDto, LoggingConfigDto, MasterConfigDto, RegistryConfigDto, RpcConfigDto, WorkerConfigDto,
};
use crate::domain::dispatch::host_selector::HostSelectorType;
use crate::domain::model::definition::DEFAULT_WORKER_GROUP;
use crate::domain::rpc::codec::SerializerType;
use crate::error::ConversionError;

fn ms(value: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default_ms))
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub serializer: SerializerType,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(3), request_timeout: Duration::from_secs(5), serializer: SerializerType::Bincode }
    }
}

impl TryFrom<RpcConfigDto> for RpcConfig {
    type Error = ConversionError;

    fn try_from(dto: RpcConfigDto) -> Result<Self, Self::Error> {
        let default = Self::default();
        Ok(Self {
            connect_timeout: dto.connect_timeout_ms.map(Duration::from_millis).unwrap_or(default.connect_timeout),
            request_timeout: dto.request_timeout_ms.map(Duration::from_millis).unwrap_or(default.request_timeout),
            serializer: dto.serializer.as_deref().map(str::parse::<SerializerType>).transpose()?.unwrap_or(default.serializer),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { session_timeout: Duration::from_secs(30), reaper_interval: Duration::from_secs(1) }
    }
}

impl From<RegistryConfigDto> for RegistryConfig {
    fn from(dto: RegistryConfigDto) -> Self {
        Self { session_timeout: ms(dto.session_timeout_ms, 30_000), reaper_interval: ms(dto.reaper_interval_ms, 1_000) }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_port: u16,
    pub host_selector: HostSelectorType,
    /// How long a DISPATCHED task may wait for its worker's ack.
    pub dispatch_ack_timeout: Duration,
    /// Dispatch attempts that may fail before the task is FAILED.
    pub max_dispatch_retries: u32,
    pub dispatch_backoff_base: Duration,
    pub dispatch_backoff_max: Duration,
    pub state_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub failover_interval: Duration,
    pub max_cpu_load_avg: f64,
    pub reserved_memory_mb: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::with_defaults(MasterConfigDto::default(), HostSelectorType::default())
    }
}

impl TryFrom<MasterConfigDto> for MasterConfig {
    type Error = ConversionError;

    fn try_from(dto: MasterConfigDto) -> Result<Self, Self::Error> {
        let host_selector = dto.host_selector.as_deref().map(str::parse::<HostSelectorType>).transpose()?.unwrap_or_default();
        Ok(Self::with_defaults(dto, host_selector))
    }
}

impl MasterConfig {
    fn with_defaults(dto: MasterConfigDto, host_selector: HostSelectorType) -> Self {
        Self {
            listen_port: dto.listen_port.unwrap_or(5678),
            host_selector,
            dispatch_ack_timeout: ms(dto.dispatch_ack_timeout_ms, 10_000),
            max_dispatch_retries: dto.max_dispatch_retries.unwrap_or(3),
            dispatch_backoff_base: ms(dto.dispatch_backoff_base_ms, 500),
            dispatch_backoff_max: ms(dto.dispatch_backoff_max_ms, 10_000),
            state_check_interval: ms(dto.state_check_interval_ms, 500),
            heartbeat_interval: ms(dto.heartbeat_interval_ms, 3_000),
            failover_interval: ms(dto.failover_interval_ms, 5_000),
            max_cpu_load_avg: dto.max_cpu_load_avg.unwrap_or(-1.0),
            reserved_memory_mb: dto.reserved_memory_mb.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_port: u16,
    pub group: String,
    pub exec_threads: u32,
    pub host_weight: u32,
    pub heartbeat_interval: Duration,
    pub result_retry_interval: Duration,
    pub max_result_retries: u32,
    /// Negative disables the cpu check.
    pub max_cpu_load_avg: f64,
    pub reserved_memory_mb: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(WorkerConfigDto::default())
    }
}

impl From<WorkerConfigDto> for WorkerConfig {
    fn from(dto: WorkerConfigDto) -> Self {
        Self {
            listen_port: dto.listen_port.unwrap_or(1234),
            group: dto.group.unwrap_or_else(|| DEFAULT_WORKER_GROUP.to_string()),
            exec_threads: dto.exec_threads.unwrap_or(10).max(1),
            host_weight: dto.host_weight.unwrap_or(100),
            heartbeat_interval: ms(dto.heartbeat_interval_ms, 3_000),
            result_retry_interval: ms(dto.result_retry_interval_ms, 1_000),
            max_result_retries: dto.max_result_retries.unwrap_or(30),
            max_cpu_load_avg: dto.max_cpu_load_avg.unwrap_or(-1.0),
            reserved_memory_mb: dto.reserved_memory_mb.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub listen_port: u16,
    pub send_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self::from(AlertConfigDto::default())
    }
}

impl From<AlertConfigDto> for AlertConfig {
    fn from(dto: AlertConfigDto) -> Self {
        Self { enabled: dto.enabled.unwrap_or(true), listen_port: dto.listen_port.unwrap_or(50052), send_timeout: ms(dto.send_timeout_ms, 3_000) }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
    pub file: String,
    /// CSV audit file of the statistics collector, disabled when absent.
    pub stats_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::from(LoggingConfigDto::default())
    }
}

impl From<LoggingConfigDto> for LoggingConfig {
    fn from(dto: LoggingConfigDto) -> Self {
        Self {
            level: dto.level.unwrap_or_else(|| "info".to_string()),
            dir: dto.dir.unwrap_or_else(|| "logs".to_string()),
            file: dto.file.unwrap_or_else(|| "scheduler.log".to_string()),
            stats_file: dto.stats_file,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub rpc: RpcConfig,
    pub registry: RegistryConfig,
    pub master: MasterConfig,
    pub worker: WorkerConfig,
    pub alert: AlertConfig,
    pub logging: LoggingConfig,
}

impl TryFrom<ClusterConfigDto> for ClusterConfig {
    type Error = ConversionError;

    fn try_from(dto: ClusterConfigDto) -> Result<Self, Self::Error> {
        Ok(Self {
            rpc: dto.rpc.map(RpcConfig::try_from).transpose()?.unwrap_or_default(),
            registry: dto.registry.map(RegistryConfig::from).unwrap_or_default(),
            master: dto.master.map(MasterConfig::try_from).transpose()?.unwrap_or_default(),
            worker: dto.worker.map(WorkerConfig::from).unwrap_or_default(),
            alert: dto.alert.map(AlertConfig::from).unwrap_or_default(),
            logging: dto.logging.map(LoggingConfig::from).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let dto: ClusterConfigDto = serde_json::from_str("{}").unwrap();
        let config = ClusterConfig::try_from(dto).unwrap();

        assert_eq!(config.rpc.serializer, SerializerType::Bincode);
        assert_eq!(config.master.host_selector, HostSelectorType::LowerWeight);
        assert_eq!(config.master.max_dispatch_retries, 3);
        assert_eq!(config.worker.group, DEFAULT_WORKER_GROUP);
        assert!(config.logging.stats_file.is_none());
    }

    #[test]
    fn partial_sections_override_defaults() {
        let json = r#"{
            "rpc": { "serializer": "json", "requestTimeoutMs": 250 },
            "master": { "hostSelector": "round_robin", "dispatchAckTimeoutMs": 100 },
            "worker": { "group": "gpu", "execThreads": 0 }
        }"#;
        let config = ClusterConfig::try_from(serde_json::from_str::<ClusterConfigDto>(json).unwrap()).unwrap();

        assert_eq!(config.rpc.serializer, SerializerType::Json);
        assert_eq!(config.rpc.request_timeout, Duration::from_millis(250));
        assert_eq!(config.master.host_selector, HostSelectorType::RoundRobin);
        assert_eq!(config.master.dispatch_ack_timeout, Duration::from_millis(100));
        assert_eq!(config.master.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.worker.group, "gpu");
        assert_eq!(config.worker.exec_threads, 1);
    }

    #[test]
    fn unknown_selector_is_a_conversion_error() {
        let json = r#"{ "master": { "hostSelector": "fastest" } }"#;
        let dto: ClusterConfigDto = serde_json::from_str(json).unwrap();
        assert!(matches!(ClusterConfig::try_from(dto), Err(ConversionError::UnknownHostSelector(_))));
    }
}
