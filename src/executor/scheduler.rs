use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rate limiter shared by every invocation in one process.
///
/// The first call is admitted immediately; every later call waits `delay`
/// first. The counter is atomic so the dispatcher's workers can share one
/// scheduler behind an `Arc`.
#[derive(Debug)]
pub struct Scheduler {
    delay: Duration,
    calls: AtomicU64,
}

impl Scheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU64::new(0),
        }
    }

    /// Count one call, sleeping first unless it is the first.
    pub async fn admit(&self) {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        if previous > 0 && !self.delay.is_zero() {
            tracing::debug!(call = previous + 1, delay_secs = self.delay.as_secs(), "Rate limiting executor call");
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Calls admitted so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_first_call_is_not_delayed() {
        let scheduler = Scheduler::new(Duration::from_secs(5));
        let start = Instant::now();
        scheduler.admit().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.calls(), 1);
    }

    #[tokio::test]
    async fn test_later_calls_wait_for_delay() {
        let scheduler = Scheduler::new(Duration::from_millis(50));
        scheduler.admit().await;
        let start = Instant::now();
        scheduler.admit().await;
        scheduler.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(scheduler.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_delay_counts_without_sleeping() {
        let scheduler = Scheduler::new(Duration::ZERO);
        for _ in 0..5 {
            scheduler.admit().await;
        }
        assert_eq!(scheduler.calls(), 5);
    }
}
