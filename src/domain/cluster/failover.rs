use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::model::cluster_node::{HeartbeatInfo, NodeRole};
use crate::domain::registry::registry_client::{RegistryClient, RegistryEventKind, list_json};
use crate::domain::registry::registry_path::{failover_finished_path, failover_lock_path, role_prefix};
use crate::domain::utils::id::Host;
use crate::error::{Error, RegistryError};

/// Recovery work for one dead node of one role.
#[async_trait]
pub trait FailoverHandler: Send + Sync {
    fn role(&self) -> NodeRole;

    async fn handle(&self, dead: &HeartbeatInfo) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// Nodes this detector failed over.
    pub handled: Vec<Host>,
    /// Nodes another detector owns or already finished.
    pub skipped: Vec<Host>,
    /// Nodes whose handler failed, retried on the next scan.
    pub failed: Vec<Host>,
}

impl FailoverReport {
    pub fn is_empty(&self) -> bool {
        self.handled.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Diffs the registry membership against the last known view and fails
/// over every node that disappeared. Across all detectors in the cluster
/// the per-node lock plus the finished marker make exactly one of them
/// run the handler for one incarnation of a node.
pub struct FailoverDetector {
    registry: Arc<dyn RegistryClient>,
    handlers: Vec<Arc<dyn FailoverHandler>>,
    /// Last seen members, keyed by registry path.
    known: Mutex<HashMap<String, HeartbeatInfo>>,
    /// Dead nodes whose handler returned an error.
    retry: Mutex<HashMap<String, HeartbeatInfo>>,
}

impl FailoverDetector {
    pub fn new(registry: Arc<dyn RegistryClient>, handlers: Vec<Arc<dyn FailoverHandler>>) -> Self {
        Self { registry, handlers, known: Mutex::new(HashMap::new()), retry: Mutex::new(HashMap::new()) }
    }

    async fn members(&self, role: NodeRole) -> Result<HashMap<String, HeartbeatInfo>, RegistryError> {
        Ok(list_json::<HeartbeatInfo>(self.registry.as_ref(), role_prefix(role)).await?.into_iter().collect())
    }

    /// Takes the current membership as the baseline.
    pub async fn prime(&self) -> Result<(), RegistryError> {
        let mut current = HashMap::new();
        for handler in &self.handlers {
            current.extend(self.members(handler.role()).await?);
        }
        *self.known.lock().expect("Mutex poisoned") = current;
        Ok(())
    }

    pub async fn scan(&self) -> Result<FailoverReport, RegistryError> {
        let mut report = FailoverReport::default();

        for handler in &self.handlers {
            let role = handler.role();
            let current = self.members(role).await?;

            let mut dead: Vec<(String, HeartbeatInfo)> = {
                let mut known = self.known.lock().expect("Mutex poisoned");
                let prefix = role_prefix(role);
                let gone: Vec<(String, HeartbeatInfo)> = known
                    .iter()
                    .filter(|(path, _)| path.starts_with(prefix) && !current.contains_key(*path))
                    .map(|(path, info)| (path.clone(), info.clone()))
                    .collect();
                known.retain(|path, _| !path.starts_with(prefix));
                known.extend(current.clone());
                gone
            };
            {
                let mut retry = self.retry.lock().expect("Mutex poisoned");
                let pending: Vec<String> = retry.keys().filter(|p| p.starts_with(role_prefix(role))).cloned().collect();
                for path in pending {
                    if let Some(info) = retry.remove(&path) {
                        dead.push((path, info));
                    }
                }
            }

            for (path, info) in dead {
                match self.fail_over(handler.as_ref(), &info).await {
                    Ok(true) => report.handled.push(info.host.clone()),
                    Ok(false) => report.skipped.push(info.host.clone()),
                    Err(e) => {
                        log::error!("Failover of {} {} failed: {}", role.as_str(), info.host, e);
                        report.failed.push(info.host.clone());
                        self.retry.lock().expect("Mutex poisoned").insert(path, info);
                    }
                }
            }
        }

        Ok(report)
    }

    /// Returns `Ok(false)` if another detector holds the lock or the node
    /// incarnation was already failed over.
    async fn fail_over(&self, handler: &dyn FailoverHandler, dead: &HeartbeatInfo) -> Result<bool, Error> {
        let role = handler.role();
        let lock = failover_lock_path(role, &dead.host);
        if !self.registry.try_acquire_lock(&lock).await? {
            log::info!("Failover of {} {} is owned by another node", role.as_str(), dead.host);
            return Ok(false);
        }

        let result = self.fail_over_locked(handler, dead).await;
        if let Err(e) = self.registry.release_lock(&lock).await {
            log::warn!("Releasing {} failed: {}", lock, e);
        }
        result
    }

    async fn fail_over_locked(&self, handler: &dyn FailoverHandler, dead: &HeartbeatInfo) -> Result<bool, Error> {
        let role = handler.role();
        let marker = failover_finished_path(role, &dead.host, dead.startup_time);
        if self.registry.exists(&marker).await? {
            log::info!("Failover of {} {} already finished", role.as_str(), dead.host);
            return Ok(false);
        }

        tracing::info!(role = role.as_str(), host = %dead.host, "starting failover");
        handler.handle(dead).await?;
        self.registry.persist(&marker, dead.report_time.to_string()).await?;
        tracing::info!(role = role.as_str(), host = %dead.host, "failover finished");
        Ok(true)
    }

    /// Scans on every membership removal and at a fixed interval.
    pub fn start(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.prime().await {
                log::error!("Failover detector could not read membership: {}", e);
            }

            let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
            for handler in &self.handlers {
                match self.registry.subscribe(role_prefix(handler.role())).await {
                    Ok(mut rx) => {
                        let tx = events_tx.clone();
                        tokio::spawn(async move {
                            while let Some(event) = rx.recv().await {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Err(e) => log::warn!("Membership watch unavailable, relying on periodic scans: {}", e),
                }
            }
            drop(events_tx);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    Some(event) = events.recv() => {
                        if event.kind != RegistryEventKind::Removed {
                            continue;
                        }
                    }
                }
                match self.scan().await {
                    Ok(report) if !report.is_empty() => log::info!("Failover scan: {:?}", report),
                    Ok(_) => {}
                    Err(RegistryError::SessionExpired(session)) => {
                        log::error!("Failover detector stopped, registry session {} expired", session);
                        break;
                    }
                    Err(e) => log::warn!("Failover scan failed: {}", e),
                }
            }
        })
    }
}
