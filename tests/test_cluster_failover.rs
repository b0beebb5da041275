use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use dist_workflow_scheduler::domain::clock::MockClock;
use dist_workflow_scheduler::domain::cluster::failover::{FailoverDetector, FailoverHandler};
use dist_workflow_scheduler::domain::cluster::heartbeat::{HeartbeatTask, NodeHeartbeat};
use dist_workflow_scheduler::domain::model::cluster_node::{HeartbeatInfo, NodeRole};
use dist_workflow_scheduler::domain::registry::memory_registry::{MemoryCoordinator, MemoryRegistry};
use dist_workflow_scheduler::domain::registry::registry_client::RegistryClient;
use dist_workflow_scheduler::domain::registry::registry_path::{failover_finished_path, worker_path};
use dist_workflow_scheduler::domain::utils::id::Host;
use dist_workflow_scheduler::error::{EngineError, Error};

struct CountingHandler {
    calls: Arc<AtomicU32>,
    /// Fails this many calls before succeeding.
    failures: AtomicU32,
}

impl CountingHandler {
    fn new(calls: Arc<AtomicU32>) -> Self {
        Self { calls, failures: AtomicU32::new(0) }
    }
}

#[async_trait]
impl FailoverHandler for CountingHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Worker
    }

    async fn handle(&self, _dead: &HeartbeatInfo) -> Result<(), Error> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::InvalidDag("handler not ready".into()).into());
        }
        // Hold the lock long enough for the other detector to run into it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn session(coordinator: &MemoryCoordinator) -> Arc<MemoryRegistry> {
    Arc::new(MemoryRegistry::connect(coordinator))
}

async fn register_worker(coordinator: &MemoryCoordinator, clock: &MockClock, host: &Host) -> Arc<MemoryRegistry> {
    let registry = session(coordinator);
    let reporter = Arc::new(NodeHeartbeat::new(NodeRole::Worker, host.clone(), clock.shared()));
    HeartbeatTask::new(registry.clone(), worker_path("default", host), reporter, Duration::from_secs(1)).beat_once().await.unwrap();
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_detector_fails_over_a_dead_worker() {
    let coordinator = MemoryCoordinator::new(Duration::from_millis(300));
    let clock = MockClock::new(10_000);
    let host = Host::new("10.0.0.1:1234");
    let worker = register_worker(&coordinator, &clock, &host).await;

    let calls = Arc::new(AtomicU32::new(0));
    let detectors: Vec<Arc<FailoverDetector>> = (0..2)
        .map(|_| {
            let handler: Arc<dyn FailoverHandler> = Arc::new(CountingHandler::new(calls.clone()));
            Arc::new(FailoverDetector::new(session(&coordinator), vec![handler]))
        })
        .collect();
    for detector in &detectors {
        detector.prime().await.unwrap();
    }

    worker.crash();
    coordinator.expire_session(worker.session_id());

    let (first, second) = tokio::join!(detectors[0].scan(), detectors[1].scan());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.handled.len() + second.handled.len(), 1);
    assert_eq!(first.skipped.len() + second.skipped.len(), 1);

    let observer = session(&coordinator);
    assert!(observer.exists(&failover_finished_path(NodeRole::Worker, &host, 10_000)).await.unwrap());

    // Nothing left to do on later scans.
    assert!(detectors[0].scan().await.unwrap().is_empty());
    assert!(detectors[1].scan().await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_marker_prevents_a_second_failover_of_the_same_incarnation() {
    let coordinator = MemoryCoordinator::new(Duration::from_millis(300));
    let clock = MockClock::new(20_000);
    let host = Host::new("10.0.0.2:1234");

    let calls = Arc::new(AtomicU32::new(0));
    let handler: Arc<dyn FailoverHandler> = Arc::new(CountingHandler::new(calls.clone()));
    let late_handler: Arc<dyn FailoverHandler> = Arc::new(CountingHandler::new(calls.clone()));

    let worker = register_worker(&coordinator, &clock, &host).await;
    let early = FailoverDetector::new(session(&coordinator), vec![handler]);
    let late = FailoverDetector::new(session(&coordinator), vec![late_handler]);
    early.prime().await.unwrap();
    late.prime().await.unwrap();

    worker.crash();
    coordinator.expire_session(worker.session_id());
    assert_eq!(early.scan().await.unwrap().handled, vec![host.clone()]);
    assert_eq!(late.scan().await.unwrap().skipped, vec![host.clone()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A restarted worker is a new incarnation and is failed over again.
    clock.advance(Duration::from_secs(5));
    let restarted = register_worker(&coordinator, &clock, &host).await;
    early.scan().await.unwrap();
    restarted.crash();
    coordinator.expire_session(restarted.session_id());
    assert_eq!(early.scan().await.unwrap().handled, vec![host]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_handler_is_retried_on_next_scan() {
    let coordinator = MemoryCoordinator::new(Duration::from_millis(300));
    let clock = MockClock::new(30_000);
    let host = Host::new("10.0.0.3:1234");

    let calls = Arc::new(AtomicU32::new(0));
    let handler = CountingHandler { calls: calls.clone(), failures: AtomicU32::new(1) };
    let worker = register_worker(&coordinator, &clock, &host).await;
    let detector = FailoverDetector::new(session(&coordinator), vec![Arc::new(handler) as Arc<dyn FailoverHandler>]);
    detector.prime().await.unwrap();

    worker.crash();
    coordinator.expire_session(worker.session_id());

    assert_eq!(detector.scan().await.unwrap().failed, vec![host.clone()]);
    assert_eq!(detector.scan().await.unwrap().handled, vec![host]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
