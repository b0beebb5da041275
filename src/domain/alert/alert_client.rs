use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;

use crate::domain::registry::registry_client::RegistryClient;
use crate::domain::registry::registry_path::{ALERT_SERVER_PREFIX, host_of};
use crate::domain::rpc::client::RpcClient;
use crate::domain::rpc::protocol::{AlertMessage, Payload};
use crate::domain::utils::id::Host;
use crate::error::{Error, RpcError};

/// Sink for alerts raised by the engine.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: AlertMessage) -> Result<(), Error>;
}

/// Sends alerts to one of the registered alert servers.
#[derive(Debug)]
pub struct AlertClient {
    registry: Arc<dyn RegistryClient>,
    rpc: RpcClient,
    timeout: Duration,
}

impl AlertClient {
    pub fn new(registry: Arc<dyn RegistryClient>, rpc: RpcClient, timeout: Duration) -> Self {
        Self { registry, rpc, timeout }
    }

    async fn pick_server(&self) -> Result<Option<Host>, Error> {
        let servers: Vec<Host> = self.registry.list(ALERT_SERVER_PREFIX).await?.into_iter().map(|(path, _)| host_of(&path)).collect();
        Ok(servers.choose(&mut rand::rng()).cloned())
    }
}

#[async_trait]
impl AlertNotifier for AlertClient {
    async fn notify(&self, alert: AlertMessage) -> Result<(), Error> {
        let Some(server) = self.pick_server().await? else {
            log::warn!("No alert server registered, dropping alert '{}'", alert.title);
            return Ok(());
        };

        match self.rpc.send_sync(&server, Payload::AlertSendRequest(alert), self.timeout).await? {
            Payload::AlertSendResponse { delivered: true, .. } => Ok(()),
            Payload::AlertSendResponse { delivered: false, message } => {
                Err(RpcError::Remote { host: server, message: message.unwrap_or_default() }.into())
            }
            _ => Err(RpcError::UnexpectedResponse { host: server, expected: "ALERT_SEND_RESPONSE" }.into()),
        }
    }
}
