//! Keeping the local rule set in step with the server.
//!
//! [`SyncHelper`] runs the fetch-until-target loop. [`SyncManager`] decides when to run it: on a
//! polling schedule, in response to streaming notifications, or when the host asks for a pass.
use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

mod backoff;
mod change_checker;
pub(crate) mod change_processor;
mod guardian;
mod manager;
mod poller_thread;
mod proxy_handler;
mod sync_helper;
#[cfg(test)]
mod test_support;

pub use backoff::BackoffCounter;
pub use change_checker::ChangeChecker;
pub use guardian::SyncGuardian;
pub use manager::{FlagUpdate, RuleBasedSegmentUpdate, StreamingStatus, SyncManager};
pub use poller_thread::PollerThread;
pub use proxy_handler::{InMemoryProxyCheckStore, ProxyCheckStore, ProxyHandler, ProxyHandlingState};
pub use sync_helper::{SyncHelper, SyncOutcome, SyncTarget};

/// One-way stop flag that sleeping threads can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    /// Wake every waiter. Later waits return immediately.
    pub fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless stopped first. Returns `true` if the signal was stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .condvar
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::StopSignal;

    #[test]
    fn wait_times_out_when_not_stopped() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn stop_wakes_sleeping_thread() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                let started = Instant::now();
                (signal.wait_timeout(Duration::from_secs(60)), started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        signal.stop();

        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(60));
        assert!(signal.wait_timeout(Duration::from_secs(60)));
    }
}
