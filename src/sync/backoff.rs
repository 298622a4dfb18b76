use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

/// Exponential backoff: `base * 2^attempt`, capped.
///
/// The counter is shared through `&self` so the sync loop and the streaming reconnect logic can
/// hold it behind an `Arc`.
#[derive(Debug)]
pub struct BackoffCounter {
    base: Duration,
    cap: Duration,
    attempt: AtomicU32,
}

impl BackoffCounter {
    pub fn new(base: Duration, cap: Duration) -> BackoffCounter {
        BackoffCounter {
            base,
            cap,
            attempt: AtomicU32::new(0),
        }
    }

    /// Delay before the next attempt. Each call advances the counter.
    pub fn next_delay(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Relaxed);
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BackoffCounter;

    #[test]
    fn doubles_until_cap() {
        let backoff = BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn reset_starts_over() {
        let backoff = BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(1800));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn large_attempts_saturate_at_cap() {
        let backoff = BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(1800));
        for _ in 0..40 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1800));
    }
}
