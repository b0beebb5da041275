use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock used for all lifecycle timestamps and task timeouts.
///
/// Engines never read the system time directly so that retry back-off and
/// timeout handling can be driven deterministically in tests.
pub trait Clock: Debug + Send + Sync {
    fn now_ms(&self) -> i64;

    fn now_s(&self) -> i64 {
        self.now_ms() / 1000
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
    }
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct MockClock {
    time: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Self {
        Self { time: Arc::new(AtomicI64::new(start_ms)) }
    }

    pub fn set(&self, time_ms: i64) {
        self.time.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.time.fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_is_shared_between_clones() {
        let clock = MockClock::new(1_000);
        let shared = clock.shared();

        clock.advance(Duration::from_millis(500));
        assert_eq!(shared.now_ms(), 1_500);
        assert_eq!(shared.now_s(), 1);
    }
}
