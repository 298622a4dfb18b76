//! Coordinator of the sync transports.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    config::SyncConfig,
    events::{EventListener, SyncEvent},
    fetcher::{Fetch, HttpFetcher},
    rules::models::{
        ChangePageWire, ChangeSetWire, RuleBasedSegmentWire, SplitChangeWire, SplitWire,
        TargetingRulesChangeWire, TryParse,
    },
    snapshot::ChangeNumbers,
    storage::RuleSetStorage,
    Result,
};

use super::{
    BackoffCounter, InMemoryProxyCheckStore, PollerThread, ProxyCheckStore, ProxyHandler,
    StopSignal, SyncGuardian, SyncHelper, SyncOutcome, SyncTarget,
};

/// State of the streaming connection, as reported by the host's push client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    /// Push messages are flowing.
    Connected,
    /// The connection dropped and will be retried.
    Disconnected,
    /// The server reported that streaming is temporarily unavailable.
    Down,
    /// Streaming is off for the rest of the session.
    Disabled,
}

/// Push notification announcing a new flag change number.
#[derive(Debug, Clone)]
pub struct FlagUpdate {
    pub change_number: i64,
    /// Change number the embedded definition applies on top of.
    pub previous_change_number: Option<i64>,
    /// Definition decoded from the notification payload, if it carried one.
    pub definition: Option<SplitWire>,
}

/// Push notification announcing a new rule-based segments change number.
#[derive(Debug, Clone)]
pub struct RuleBasedSegmentUpdate {
    pub change_number: i64,
    pub previous_change_number: Option<i64>,
    pub definition: Option<RuleBasedSegmentWire>,
}

/// Drives [`SyncHelper`]: polls while streaming is unavailable, reacts to push notifications and
/// catches up when the host returns to the foreground.
pub struct SyncManager {
    sync_enabled: bool,
    streaming_enabled: bool,
    polling_interval: Duration,
    polling_jitter: Duration,
    storage: Arc<dyn RuleSetStorage>,
    listener: Arc<dyn EventListener>,
    proxy: Arc<ProxyHandler>,
    helper: Arc<SyncHelper>,
    guardian: SyncGuardian,
    reconnect_backoff: BackoffCounter,
    stop: Arc<StopSignal>,
    poller: Mutex<Option<PollerThread>>,
}

impl SyncManager {
    pub fn new(
        config: &SyncConfig,
        fetcher: Arc<dyn Fetch>,
        storage: Arc<dyn RuleSetStorage>,
        proxy_store: Arc<dyn ProxyCheckStore>,
        listener: Arc<dyn EventListener>,
    ) -> SyncManager {
        let proxy = Arc::new(ProxyHandler::new(proxy_store, config.proxy_check_interval));
        SyncManager::with_proxy_handler(config, fetcher, storage, proxy, listener)
    }

    /// Manager talking to the Split API, with the proxy check timestamp kept in memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the base URL cannot be
    /// parsed.
    pub fn from_config(
        config: &SyncConfig,
        storage: Arc<dyn RuleSetStorage>,
        listener: Arc<dyn EventListener>,
    ) -> Result<SyncManager> {
        let fetcher = Arc::new(HttpFetcher::new(config)?);
        Ok(SyncManager::new(
            config,
            fetcher,
            storage,
            Arc::new(InMemoryProxyCheckStore::default()),
            listener,
        ))
    }

    /// Manager for sync passes scheduled by the host in the background. Proxy handling is inert
    /// there.
    pub fn for_background_sync(
        config: &SyncConfig,
        fetcher: Arc<dyn Fetch>,
        storage: Arc<dyn RuleSetStorage>,
        listener: Arc<dyn EventListener>,
    ) -> SyncManager {
        let proxy = Arc::new(ProxyHandler::inert());
        SyncManager::with_proxy_handler(config, fetcher, storage, proxy, listener)
    }

    fn with_proxy_handler(
        config: &SyncConfig,
        fetcher: Arc<dyn Fetch>,
        storage: Arc<dyn RuleSetStorage>,
        proxy: Arc<ProxyHandler>,
        listener: Arc<dyn EventListener>,
    ) -> SyncManager {
        let stop = Arc::new(StopSignal::new());
        let helper = Arc::new(SyncHelper::new(
            config,
            fetcher,
            Arc::clone(&storage),
            Arc::clone(&proxy),
            Arc::clone(&listener),
            Arc::clone(&stop),
        ));

        SyncManager {
            sync_enabled: config.sync_enabled,
            streaming_enabled: config.streaming_enabled,
            polling_interval: config.polling_interval,
            polling_jitter: config.polling_jitter,
            storage,
            listener,
            proxy,
            helper,
            guardian: SyncGuardian::new(config),
            reconnect_backoff: BackoffCounter::new(
                config.streaming_reconnect_backoff_base,
                config.streaming_reconnect_backoff_cap,
            ),
            stop,
            poller: Mutex::new(None),
        }
    }

    /// Run the initial sync.
    ///
    /// An expired cache is cleared first. When streaming is disabled, this starts the poller and
    /// waits for its first pass. Otherwise it runs one pass and waits for
    /// [`SyncManager::on_streaming_status`].
    ///
    /// # Errors
    ///
    /// Fails if storage cannot be cleared or the poller thread cannot be started.
    pub fn start(&self, now: DateTime<Utc>) -> Result<SyncOutcome> {
        self.helper.clear_expired_cache(now)?;

        if self.sync_enabled && !self.streaming_enabled {
            self.start_polling()?;
            return match &*self.lock_poller() {
                Some(poller) => poller.wait_for_first_pass(),
                None => Ok(SyncOutcome::Cancelled),
            };
        }

        Ok(self.run_sync_pass())
    }

    /// Switch transports after a streaming status change.
    ///
    /// # Errors
    ///
    /// Fails if the poller thread cannot be started.
    pub fn on_streaming_status(&self, status: StreamingStatus) -> Result<()> {
        if !self.sync_enabled {
            return Ok(());
        }

        match status {
            StreamingStatus::Connected => {
                log::info!(target: "split", "streaming connected, stopping polling");
                self.stop_polling();
                self.reconnect_backoff.reset();
                self.guardian.initialize();
                self.run_sync_pass();
            }
            StreamingStatus::Disconnected | StreamingStatus::Down | StreamingStatus::Disabled => {
                log::info!(target: "split", status:debug; "streaming unavailable, polling");
                self.start_polling()?;
            }
        }
        Ok(())
    }

    /// Handle a flag change notification.
    pub fn on_flag_update(&self, update: FlagUpdate) -> SyncOutcome {
        let stored = self.storage.change_numbers();
        if update.change_number <= stored.flags {
            log::debug!(target: "split",
                        change_number = update.change_number,
                        stored = stored.flags;
                        "ignoring outdated flag notification");
            return SyncOutcome::Success(stored);
        }

        if let (Some(definition), Some(previous)) =
            (update.definition, update.previous_change_number)
        {
            if previous == stored.flags {
                let wire = ChangeSetWire::Legacy(SplitChangeWire {
                    splits: vec![TryParse::Parsed(definition)],
                    since: previous,
                    till: update.change_number,
                });
                let applied = self
                    .helper
                    .apply_notification(wire, |current| current.flags == previous);
                if let Some(outcome) = applied {
                    self.record_success(outcome);
                    return outcome;
                }
            }
        }

        self.sync_to(ChangeNumbers::new(update.change_number, -1))
    }

    /// Handle a rule-based segment change notification.
    pub fn on_rule_based_segment_update(&self, update: RuleBasedSegmentUpdate) -> SyncOutcome {
        let stored = self.storage.change_numbers();
        if update.change_number <= stored.rule_based_segments {
            log::debug!(target: "split",
                        change_number = update.change_number,
                        stored = stored.rule_based_segments;
                        "ignoring outdated rule-based segment notification");
            return SyncOutcome::Success(stored);
        }

        if let (Some(definition), Some(previous)) =
            (update.definition, update.previous_change_number)
        {
            // Legacy payloads have no room for rule-based segments.
            if previous == stored.rule_based_segments && !self.proxy.is_fallback_mode() {
                let wire = ChangeSetWire::Targeting(TargetingRulesChangeWire {
                    ff: ChangePageWire {
                        entities: Vec::new(),
                        since: stored.flags,
                        till: stored.flags,
                    },
                    rbs: Some(ChangePageWire {
                        entities: vec![TryParse::Parsed(definition)],
                        since: previous,
                        till: update.change_number,
                    }),
                });
                // A flags page left behind by a concurrent pass is refused by the snapshot.
                let applied = self
                    .helper
                    .apply_notification(wire, |current| current.rule_based_segments == previous);
                if let Some(outcome) = applied {
                    self.record_success(outcome);
                    return outcome;
                }
            }
        }

        self.sync_to(ChangeNumbers::new(-1, update.change_number))
    }

    /// Handle a kill notification: mark the flag killed locally, then fetch the change.
    pub fn on_flag_kill(
        &self,
        flag_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> SyncOutcome {
        match self
            .storage
            .kill_flag(flag_name, default_treatment, change_number)
        {
            Ok(true) => {
                log::debug!(target: "split", flag_name, change_number; "flag killed");
                self.listener
                    .on_event(SyncEvent::updated(self.storage.change_numbers()));
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!(target: "split", flag_name, err:display; "failed to kill flag");
            }
        }

        self.sync_to(ChangeNumbers::new(change_number, -1))
    }

    /// Apply a max sync period pushed by the server.
    pub fn on_sync_period_hint(&self, period: Duration) {
        self.guardian.set_max_sync_period(period);
    }

    /// Host returned to the foreground. Runs a pass if streaming has been quiet for too long.
    pub fn on_foreground(&self, now: DateTime<Utc>) -> Option<SyncOutcome> {
        self.guardian
            .must_sync(now)
            .then(|| self.run_sync_pass())
    }

    /// Delay before the next streaming reconnection attempt.
    pub fn next_streaming_reconnect_delay(&self) -> Duration {
        self.reconnect_backoff.next_delay()
    }

    /// Run one sync pass. Entry point for host schedulers.
    pub fn run_sync_pass(&self) -> SyncOutcome {
        let outcome = self.helper.sync(SyncTarget::Latest);
        self.record_success(outcome);
        outcome
    }

    /// Whether the poller thread is running.
    pub fn is_polling(&self) -> bool {
        self.lock_poller().is_some()
    }

    /// Cancel running passes and stop polling. Does not wait for the poller thread to exit.
    pub fn stop(&self) {
        self.stop.stop();
        self.stop_polling();
    }

    /// Stop and wait for the poller thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncThreadPanicked`](crate::Error::SyncThreadPanicked) if the poller
    /// thread panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop.stop();
        let poller = self
            .poller
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match poller {
            Some(poller) => poller.shutdown(),
            None => Ok(()),
        }
    }

    fn sync_to(&self, target: ChangeNumbers) -> SyncOutcome {
        let outcome = self.helper.sync(SyncTarget::AtLeast(target));
        self.record_success(outcome);
        outcome
    }

    fn record_success(&self, outcome: SyncOutcome) {
        if let SyncOutcome::Success(_) = outcome {
            self.guardian.update_last_sync_timestamp(Utc::now());
        }
    }

    fn start_polling(&self) -> Result<()> {
        let mut poller = self.lock_poller();
        if poller.is_none() {
            log::debug!(target: "split",
                        interval:debug = self.polling_interval;
                        "starting poller thread");
            *poller = Some(PollerThread::start(
                Arc::clone(&self.helper),
                self.polling_interval,
                self.polling_jitter,
            )?);
        }
        Ok(())
    }

    fn stop_polling(&self) {
        if let Some(poller) = self.lock_poller().take() {
            log::debug!(target: "split", "stopping poller thread");
            poller.stop();
        }
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<PollerThread>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
