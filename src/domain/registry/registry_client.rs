use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub path: String,
    pub kind: RegistryEventKind,
    /// Data after the change, or the last data for `Removed`.
    pub data: Option<String>,
}

/// Session-scoped client of the coordination service.
///
/// Ephemeral entries and locks belong to the session and vanish when it is
/// closed or expires.
#[async_trait]
pub trait RegistryClient: Send + Sync + std::fmt::Debug {
    fn session_id(&self) -> u64;

    /// Creates or overwrites an entry bound to this session.
    async fn register_ephemeral(&self, path: &str, data: String) -> Result<(), RegistryError>;

    /// Creates or overwrites an entry that outlives the session.
    async fn persist(&self, path: &str, data: String) -> Result<(), RegistryError>;

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError>;

    /// Names of the direct children of `path`.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, RegistryError>;

    /// All entries strictly below `prefix`, as (path, data).
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError>;

    async fn exists(&self, path: &str) -> Result<bool, RegistryError>;

    async fn remove(&self, path: &str) -> Result<(), RegistryError>;

    /// Streams every change at or below `prefix`.
    async fn subscribe(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError>;

    /// Non-blocking advisory lock. `Ok(false)` if another session holds it.
    async fn try_acquire_lock(&self, path: &str) -> Result<bool, RegistryError>;

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<bool, RegistryError>;

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError>;

    async fn close(&self);
}

pub async fn put_ephemeral_json<T: Serialize>(registry: &dyn RegistryClient, path: &str, value: &T) -> Result<(), RegistryError> {
    let data = serde_json::to_string(value).map_err(|e| serialization_error(path, e))?;
    registry.register_ephemeral(path, data).await
}

pub async fn put_persistent_json<T: Serialize>(registry: &dyn RegistryClient, path: &str, value: &T) -> Result<(), RegistryError> {
    let data = serde_json::to_string(value).map_err(|e| serialization_error(path, e))?;
    registry.persist(path, data).await
}

pub async fn get_json<T: DeserializeOwned>(registry: &dyn RegistryClient, path: &str) -> Result<Option<T>, RegistryError> {
    match registry.get(path).await? {
        Some(data) => serde_json::from_str(&data).map(Some).map_err(|e| serialization_error(path, e)),
        None => Ok(None),
    }
}

/// Decodes every entry below `prefix`. Entries that fail to decode are
/// logged and skipped.
pub async fn list_json<T: DeserializeOwned>(registry: &dyn RegistryClient, prefix: &str) -> Result<Vec<(String, T)>, RegistryError> {
    let entries = registry.list(prefix).await?;
    Ok(entries
        .into_iter()
        .filter_map(|(path, data)| match serde_json::from_str(&data) {
            Ok(value) => Some((path, value)),
            Err(e) => {
                log::warn!("Skipping undecodable registry entry {}: {}", path, e);
                None
            }
        })
        .collect())
}

fn serialization_error(path: &str, e: serde_json::Error) -> RegistryError {
    RegistryError::Serialization { path: path.to_string(), reason: e.to_string() }
}
