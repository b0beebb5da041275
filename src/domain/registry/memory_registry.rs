use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::registry::registry_client::{RegistryClient, RegistryEvent, RegistryEventKind};
use crate::error::RegistryError;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct Entry {
    data: String,
    /// Owning session of an ephemeral entry.
    owner: Option<u64>,
}

#[derive(Debug)]
struct Watch {
    prefix: String,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Debug, Default)]
struct CoordinatorInner {
    entries: BTreeMap<String, Entry>,
    /// Live sessions and their last renewal.
    sessions: HashMap<u64, Instant>,
    locks: HashMap<String, u64>,
    watches: Vec<Watch>,
}

impl CoordinatorInner {
    fn check_session(&self, session: u64) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&session) { Ok(()) } else { Err(RegistryError::SessionExpired(session)) }
    }

    fn notify(&mut self, event: RegistryEvent) {
        self.watches.retain(|watch| {
            if !is_at_or_below(&event.path, &watch.prefix) {
                return !watch.tx.is_closed();
            }
            watch.tx.send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, path: &str, data: String, owner: Option<u64>) {
        let kind = if self.entries.contains_key(path) { RegistryEventKind::Updated } else { RegistryEventKind::Added };
        self.entries.insert(path.to_string(), Entry { data: data.clone(), owner });
        self.notify(RegistryEvent { path: path.to_string(), kind, data: Some(data) });
    }

    fn delete(&mut self, path: &str) {
        if let Some(entry) = self.entries.remove(path) {
            self.notify(RegistryEvent { path: path.to_string(), kind: RegistryEventKind::Removed, data: Some(entry.data) });
        }
    }

    /// Drops a session together with its ephemeral entries and locks.
    fn end_session(&mut self, session: u64) {
        if self.sessions.remove(&session).is_none() {
            return;
        }
        let owned: Vec<String> =
            self.entries.iter().filter(|(_, entry)| entry.owner == Some(session)).map(|(path, _)| path.clone()).collect();
        for path in owned {
            self.delete(&path);
        }
        self.locks.retain(|_, holder| *holder != session);
    }
}

fn is_at_or_below(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')) || prefix.is_empty()
}

/// Embedded coordination service: a hierarchical key space with
/// session-bound ephemeral entries, prefix watches and advisory locks.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<CoordinatorInner>>,
    next_session: Arc<AtomicU64>,
    session_timeout: Duration,
}

impl MemoryCoordinator {
    pub fn new(session_timeout: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(CoordinatorInner::default())), next_session: Arc::new(AtomicU64::new(1)), session_timeout }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Spawns the task expiring sessions that were not renewed within the
    /// session timeout.
    pub fn start_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for session in coordinator.reap_expired() {
                            log::warn!("Registry session {} expired", session);
                        }
                    }
                }
            }
        })
    }

    /// Expires every session older than the timeout and returns their ids.
    pub fn reap_expired(&self) -> Vec<u64> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        let now = Instant::now();
        let expired: Vec<u64> =
            guard.sessions.iter().filter(|(_, renewed)| now.duration_since(**renewed) > self.session_timeout).map(|(id, _)| *id).collect();
        for session in &expired {
            guard.end_session(*session);
        }
        expired
    }

    /// Terminates a session immediately, as if its owner crashed and the
    /// timeout already elapsed.
    pub fn expire_session(&self, session: u64) {
        self.inner.lock().expect("Mutex poisoned").end_session(session);
    }

    pub fn is_session_alive(&self, session: u64) -> bool {
        self.inner.lock().expect("Mutex poisoned").sessions.contains_key(&session)
    }

    fn open_session(&self) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().expect("Mutex poisoned").sessions.insert(id, Instant::now());
        id
    }

    fn renew(&self, session: u64) -> Result<(), RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        match guard.sessions.get_mut(&session) {
            Some(renewed) => {
                *renewed = Instant::now();
                Ok(())
            }
            None => Err(RegistryError::SessionExpired(session)),
        }
    }

    fn put(&self, session: u64, path: &str, data: String, ephemeral: bool) -> Result<(), RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        guard.put(path, data, ephemeral.then_some(session));
        Ok(())
    }

    fn get(&self, session: u64, path: &str) -> Result<Option<String>, RegistryError> {
        let guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        Ok(guard.entries.get(path).map(|entry| entry.data.clone()))
    }

    fn list(&self, session: u64, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        Ok(guard
            .entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, entry)| (path.clone(), entry.data.clone()))
            .collect())
    }

    fn remove(&self, session: u64, path: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        guard.delete(path);
        Ok(())
    }

    fn watch(&self, session: u64, prefix: &str) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        let (tx, rx) = mpsc::unbounded_channel();
        guard.watches.push(Watch { prefix: prefix.to_string(), tx });
        Ok(rx)
    }

    fn try_lock(&self, session: u64, path: &str) -> Result<bool, RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        match guard.locks.get(path) {
            Some(holder) => Ok(*holder == session),
            None => {
                guard.locks.insert(path.to_string(), session);
                Ok(true)
            }
        }
    }

    fn unlock(&self, session: u64, path: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        guard.check_session(session)?;
        if guard.locks.get(path) == Some(&session) {
            guard.locks.remove(path);
        }
        Ok(())
    }
}

/// One session against a `MemoryCoordinator`. A keep-alive task renews the
/// session until `close` (graceful) or `crash` (simulated process death,
/// the session then expires through the reaper).
#[derive(Debug)]
pub struct MemoryRegistry {
    coordinator: MemoryCoordinator,
    session: u64,
    keep_alive: CancellationToken,
}

impl MemoryRegistry {
    pub fn connect(coordinator: &MemoryCoordinator) -> Self {
        let session = coordinator.open_session();
        let keep_alive = CancellationToken::new();

        let renew_every = (coordinator.session_timeout / 3).max(Duration::from_millis(10));
        let token = keep_alive.clone();
        let coordinator_clone = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if coordinator_clone.renew(session).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        log::debug!("Registry session {} opened", session);
        Self { coordinator: coordinator.clone(), session, keep_alive }
    }

    /// Stops renewing without closing the session.
    pub fn crash(&self) {
        self.keep_alive.cancel();
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        self.keep_alive.cancel();
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn session_id(&self) -> u64 {
        self.session
    }

    async fn register_ephemeral(&self, path: &str, data: String) -> Result<(), RegistryError> {
        self.coordinator.put(self.session, path, data, true)
    }

    async fn persist(&self, path: &str, data: String) -> Result<(), RegistryError> {
        self.coordinator.put(self.session, path, data, false)
    }

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError> {
        self.coordinator.get(self.session, path)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = self
            .coordinator
            .list(self.session, path)?
            .into_iter()
            .filter_map(|(full, _)| full.strip_prefix(&prefix).and_then(|rest| rest.split('/').next()).map(str::to_string))
            .collect();
        children.dedup();
        Ok(children)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        self.coordinator.list(self.session, prefix)
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        Ok(self.coordinator.get(self.session, path)?.is_some())
    }

    async fn remove(&self, path: &str) -> Result<(), RegistryError> {
        self.coordinator.remove(self.session, path)
    }

    async fn subscribe(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, RegistryError> {
        self.coordinator.watch(self.session, prefix)
    }

    async fn try_acquire_lock(&self, path: &str) -> Result<bool, RegistryError> {
        self.coordinator.try_lock(self.session, path)
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<bool, RegistryError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.coordinator.try_lock(self.session, path)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError> {
        self.coordinator.unlock(self.session, path)
    }

    async fn close(&self) {
        self.keep_alive.cancel();
        self.coordinator.expire_session(self.session);
        log::debug!("Registry session {} closed", self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> MemoryCoordinator {
        MemoryCoordinator::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn ephemeral_entries_vanish_with_their_session() {
        let coordinator = coordinator();
        let owner = MemoryRegistry::connect(&coordinator);
        let observer = MemoryRegistry::connect(&coordinator);

        owner.register_ephemeral("/nodes/worker/default/w1:1", "{}".into()).await.unwrap();
        owner.persist("/nodes/failover-finished/worker/w0:1@1", "done".into()).await.unwrap();
        let mut events = observer.subscribe("/nodes/worker").await.unwrap();

        owner.close().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, RegistryEventKind::Removed);
        assert_eq!(event.path, "/nodes/worker/default/w1:1");
        assert!(!observer.exists("/nodes/worker/default/w1:1").await.unwrap());
        assert!(observer.exists("/nodes/failover-finished/worker/w0:1@1").await.unwrap());
        assert!(matches!(owner.get("/nodes").await, Err(RegistryError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn crashed_session_is_reaped_after_timeout() {
        let coordinator = coordinator();
        let shutdown = CancellationToken::new();
        coordinator.start_reaper(Duration::from_millis(20), shutdown.clone());

        let healthy = MemoryRegistry::connect(&coordinator);
        let crashed = MemoryRegistry::connect(&coordinator);
        crashed.register_ephemeral("/nodes/master/m1:1", "{}".into()).await.unwrap();

        crashed.crash();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!coordinator.is_session_alive(crashed.session_id()));
        assert!(coordinator.is_session_alive(healthy.session_id()));
        assert!(!healthy.exists("/nodes/master/m1:1").await.unwrap());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn lock_has_one_holder_and_is_released_on_session_loss() {
        let coordinator = coordinator();
        let a = MemoryRegistry::connect(&coordinator);
        let b = MemoryRegistry::connect(&coordinator);
        let path = "/lock/failover/worker/w1:1";

        assert!(a.try_acquire_lock(path).await.unwrap());
        assert!(!b.try_acquire_lock(path).await.unwrap());
        assert!(!b.acquire_lock(path, Duration::from_millis(50)).await.unwrap());

        a.close().await;
        assert!(b.try_acquire_lock(path).await.unwrap());
        b.release_lock(path).await.unwrap();
    }

    #[tokio::test]
    async fn children_and_listing() {
        let coordinator = coordinator();
        let registry = MemoryRegistry::connect(&coordinator);
        registry.register_ephemeral("/nodes/worker/default/w1:1", "a".into()).await.unwrap();
        registry.register_ephemeral("/nodes/worker/default/w2:1", "b".into()).await.unwrap();
        registry.register_ephemeral("/nodes/worker/gpu/w3:1", "c".into()).await.unwrap();
        registry.register_ephemeral("/nodes/workers-other/x", "d".into()).await.unwrap();

        assert_eq!(registry.get_children("/nodes/worker").await.unwrap(), vec!["default".to_string(), "gpu".to_string()]);
        assert_eq!(registry.list("/nodes/worker").await.unwrap().len(), 3);
        assert_eq!(registry.get("/nodes/worker/gpu/w3:1").await.unwrap().as_deref(), Some("c"));
    }
}
