/// Bounded polling with exponential backoff
///
/// Checks a predicate immediately, then after sleeps that double from the
/// initial interval. The last sleep is clipped so the wait never runs past
/// the deadline.
use tokio::time::{sleep, Duration, Instant};

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedWaiter {
    initial_interval: Duration,
    deadline: Duration,
}

impl BoundedWaiter {
    pub fn new(initial_interval: Duration, deadline: Duration) -> Self {
        Self {
            initial_interval: initial_interval.max(Duration::from_millis(1)),
            deadline,
        }
    }

    pub fn from_millis(initial_interval_ms: u64, deadline_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_interval_ms),
            Duration::from_millis(deadline_ms),
        )
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Poll `predicate` until it holds or the deadline passes
    pub async fn wait_for<F>(&self, mut predicate: F) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let started = Instant::now();
        let mut interval = self.initial_interval;

        loop {
            if predicate() {
                return WaitOutcome::Ready;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                return WaitOutcome::TimedOut;
            }

            sleep(interval.min(self.deadline - elapsed)).await;
            interval = interval.saturating_mul(2);
        }
    }
}
