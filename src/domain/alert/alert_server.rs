use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::alert::alert_channel::AlertChannel;
use crate::domain::clock::SharedClock;
use crate::domain::cluster::heartbeat::{HeartbeatTask, NodeHeartbeat};
use crate::domain::config::ClusterConfig;
use crate::domain::model::cluster_node::NodeRole;
use crate::domain::registry::registry_client::RegistryClient;
use crate::domain::registry::registry_path::alert_server_path;
use crate::domain::rpc::processor::{CommandProcessor, RequestContext};
use crate::domain::rpc::protocol::{CommandType, Payload};
use crate::domain::rpc::server::RpcServer;
use crate::domain::utils::id::Host;
use crate::error::Result;

struct AlertSendProcessor {
    channels: Vec<Arc<dyn AlertChannel>>,
}

#[async_trait]
impl CommandProcessor for AlertSendProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::AlertSendRequest
    }

    async fn process(&self, _ctx: &RequestContext, payload: Payload) -> Option<Payload> {
        let Payload::AlertSendRequest(alert) = payload else {
            return Some(Payload::error("expected ALERT_SEND_REQUEST"));
        };

        let mut failures = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.send(&alert).await {
                failures.push(format!("{}: {}", channel.name(), e));
            }
        }

        let delivered = failures.len() < self.channels.len();
        let message = (!failures.is_empty()).then(|| failures.join(", "));
        Some(Payload::AlertSendResponse { delivered, message })
    }
}

/// Standalone process receiving alerts from masters and fanning them out to
/// the configured channels.
pub struct AlertServer {
    rpc: RpcServer,
    registry: Arc<dyn RegistryClient>,
    shutdown: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl AlertServer {
    pub async fn start(
        config: &ClusterConfig,
        bind_ip: &str,
        registry: Arc<dyn RegistryClient>,
        channels: Vec<Arc<dyn AlertChannel>>,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut rpc = RpcServer::bind(&format!("{}:{}", bind_ip, config.alert.listen_port), config.rpc.serializer.build()).await?;
        rpc.register_processor(Arc::new(AlertSendProcessor { channels }));
        rpc.start();

        let host = rpc.local_host().clone();
        let reporter = Arc::new(NodeHeartbeat::new(NodeRole::AlertServer, host.clone(), clock));
        let heartbeat = HeartbeatTask::new(registry.clone(), alert_server_path(&host), reporter, config.master.heartbeat_interval);
        heartbeat.beat_once().await?;

        let shutdown = CancellationToken::new();
        let heartbeat = Some(heartbeat.start(shutdown.clone()));
        log::info!("Alert server started on {}", host);

        Ok(Self { rpc, registry, shutdown, heartbeat })
    }

    pub fn host(&self) -> &Host {
        self.rpc.local_host()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        self.rpc.shutdown().await;
        self.registry.close().await;
        log::info!("Alert server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::alert_client::{AlertClient, AlertNotifier};
    use crate::domain::clock::MockClock;
    use crate::domain::registry::memory_registry::{MemoryCoordinator, MemoryRegistry};
    use crate::domain::rpc::client::RpcClient;
    use crate::domain::rpc::protocol::{AlertLevel, AlertMessage};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collecting {
        received: Mutex<Vec<AlertMessage>>,
    }

    #[async_trait]
    impl AlertChannel for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn send(&self, alert: &AlertMessage) -> std::result::Result<(), String> {
            self.received.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl AlertChannel for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn send(&self, _alert: &AlertMessage) -> std::result::Result<(), String> {
            Err("smtp down".to_string())
        }
    }

    fn alert() -> AlertMessage {
        AlertMessage { level: AlertLevel::Critical, title: "Workflow failed".into(), content: "node b".into(), workflow_instance_id: None }
    }

    fn config() -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.alert.listen_port = 0;
        config
    }

    #[tokio::test]
    async fn alert_reaches_every_channel_of_a_registered_server() {
        let coordinator = MemoryCoordinator::new(Duration::from_secs(5));
        let collecting = Arc::new(Collecting::default());
        let channels: Vec<Arc<dyn AlertChannel>> = vec![collecting.clone(), Arc::new(Broken)];
        let server = AlertServer::start(
            &config(),
            "127.0.0.1",
            Arc::new(MemoryRegistry::connect(&coordinator)),
            channels,
            MockClock::new(0).shared(),
        )
        .await
        .unwrap();

        let rpc = RpcClient::new(&config().rpc);
        let client = AlertClient::new(Arc::new(MemoryRegistry::connect(&coordinator)), rpc.clone(), Duration::from_secs(1));
        client.notify(alert()).await.unwrap();

        assert_eq!(collecting.received.lock().unwrap().as_slice(), &[alert()]);
        rpc.close();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn alert_without_server_is_dropped() {
        let coordinator = MemoryCoordinator::new(Duration::from_secs(5));
        let rpc = RpcClient::new(&config().rpc);
        let client = AlertClient::new(Arc::new(MemoryRegistry::connect(&coordinator)), rpc, Duration::from_secs(1));

        assert!(client.notify(alert()).await.is_ok());
    }
}
