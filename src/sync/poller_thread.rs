//! A background thread that periodically runs sync passes.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

use super::{SyncHelper, SyncOutcome, SyncTarget};

/// Polling thread used while streaming is unavailable.
///
/// Each pass runs [`SyncHelper::sync`] with [`SyncTarget::Latest`], then waits for the polling
/// interval (minus a random jitter) or a stop command.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first pass finishes, then the outcome of that pass.
    first_pass: Arc<(Mutex<Option<SyncOutcome>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread. The first pass runs immediately.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        helper: Arc<SyncHelper>,
        interval: Duration,
        jitter_range: Duration,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). A buffer of 1 is enough: a full buffer means a stop command is already queued.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let first_pass = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let first_pass = Arc::clone(&first_pass);
            let record = move |outcome: SyncOutcome| {
                let mut slot = first_pass
                    .0
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(outcome);
                    first_pass.1.notify_all();
                }
            };

            std::thread::Builder::new()
                .name("split-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        log::debug!(target: "split", "polling for rule-set changes");
                        let outcome = helper.sync(SyncTarget::Latest);
                        record(outcome);

                        match outcome {
                            SyncOutcome::DoNotRetry => {
                                log::warn!(target: "split", "stopping poller, sync cannot be retried");
                                return;
                            }
                            SyncOutcome::Cancelled => return,
                            SyncOutcome::Success(_) | SyncOutcome::Exhausted => {}
                        }

                        match stop_receiver.recv_timeout(jitter(interval, jitter_range)) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to poll again.
                            }
                            Ok(()) => {
                                log::debug!(target: "split", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // The owning `PollerThread` was dropped.
                                log::debug!(target: "split", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    if result.is_err() {
                        log::error!(target: "split", "poller thread panicked");
                        record(SyncOutcome::DoNotRetry);
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            first_pass,
        })
    }

    /// Block until the first pass finishes and return its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncThreadPanicked`] if the lock was poisoned.
    pub fn wait_for_first_pass(&self) -> Result<SyncOutcome> {
        let lock = self
            .first_pass
            .0
            .lock()
            .map_err(|_| Error::SyncThreadPanicked)?;
        let lock = self
            .first_pass
            .1
            .wait_while(lock, |outcome| outcome.is_none())
            .map_err(|_| Error::SyncThreadPanicked)?;
        Ok((*lock).unwrap_or(SyncOutcome::Cancelled))
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop. A pass that is already
    /// fetching completes first.
    pub fn stop(&self) {
        // Error means that the thread exited already or another stop command is queued. Either
        // way the thread is stopping.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::SyncThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let interval = Duration::ZERO;
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::ZERO;

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::{
        events::NoopEventListener,
        fetcher::{Fetch, FetchParams},
        rules::models::ChangeSetWire,
        snapshot::ChangeNumbers,
        storage::InMemoryStorage,
        sync::{ProxyHandler, StopSignal, SyncHelper, SyncOutcome},
        FetchError, SyncConfig,
    };

    use super::PollerThread;

    /// Server that is always at change number 7, or always rejects the request.
    struct StaticFetcher {
        calls: AtomicUsize,
        reject: bool,
    }

    impl Fetch for StaticFetcher {
        fn fetch(&self, params: &FetchParams) -> Result<ChangeSetWire, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(FetchError::UriTooLong);
            }
            Ok(serde_json::from_value(serde_json::json!({
                "ff": {"d": [], "s": params.since, "t": 7},
                "rbs": {"d": [], "s": -1, "t": -1}
            }))
            .unwrap())
        }
    }

    fn helper(fetcher: Arc<StaticFetcher>) -> Arc<SyncHelper> {
        Arc::new(SyncHelper::new(
            &SyncConfig::from_sdk_key("key"),
            fetcher,
            Arc::new(InMemoryStorage::new()),
            Arc::new(ProxyHandler::inert()),
            Arc::new(NoopEventListener),
            Arc::new(StopSignal::new()),
        ))
    }

    #[test]
    fn polls_until_shut_down() {
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
            reject: false,
        });
        let poller =
            PollerThread::start(helper(fetcher.clone()), Duration::from_millis(5), Duration::ZERO)
                .unwrap();

        assert_eq!(
            poller.wait_for_first_pass().unwrap(),
            SyncOutcome::Success(ChangeNumbers::new(7, -1))
        );
        while fetcher.calls.load(Ordering::SeqCst) < 4 {
            std::thread::sleep(Duration::from_millis(1));
        }

        poller.shutdown().unwrap();
    }

    #[test]
    fn stops_polling_when_sync_cannot_be_retried() {
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
            reject: true,
        });
        let poller =
            PollerThread::start(helper(fetcher.clone()), Duration::from_millis(1), Duration::ZERO)
                .unwrap();

        assert_eq!(poller.wait_for_first_pass().unwrap(), SyncOutcome::DoNotRetry);
        poller.shutdown().unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
