//! The fetch-until-target loop.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    config::SyncConfig,
    events::{EventListener, SyncEvent},
    fetcher::{Fetch, FetchParams},
    rules::models::ChangeSetWire,
    snapshot::{ChangeNumbers, ChangeSet, RuleSetSnapshot},
    storage::RuleSetStorage,
    Error, FetchError, Result,
};

use super::{
    change_processor::ChangeProcessor, BackoffCounter, ChangeChecker, ProxyHandler, StopSignal,
};

/// What a sync pass should reach before it reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    /// Whatever the server has now. Always fetches at least once.
    Latest,
    /// Change numbers announced by a push notification. Returns without fetching if storage is
    /// already there.
    AtLeast(ChangeNumbers),
}

/// Result of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Storage reached the target. Holds the stored change numbers.
    Success(ChangeNumbers),
    /// All attempts were used without reaching the target.
    Exhausted,
    /// Retrying cannot help (request URI too long, invalid SDK key, broken storage). Periodic
    /// syncing should stop.
    DoNotRetry,
    /// The stop signal fired.
    Cancelled,
}

/// Fetches rule-set changes and applies them to storage until a target is reached.
///
/// Passes are serialized: concurrent calls to [`SyncHelper::sync`] wait for the running pass to
/// finish, and then usually return without fetching because storage is already up to date.
pub struct SyncHelper {
    fetcher: Arc<dyn Fetch>,
    storage: Arc<dyn RuleSetStorage>,
    proxy: Arc<ProxyHandler>,
    listener: Arc<dyn EventListener>,
    stop: Arc<StopSignal>,
    processor: ChangeProcessor,
    checker: ChangeChecker,
    filter_query_string: String,
    max_attempts: u32,
    cdn_bypass_threshold: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    cache_expiration: Duration,
    in_flight: Mutex<()>,
}

impl SyncHelper {
    pub fn new(
        config: &SyncConfig,
        fetcher: Arc<dyn Fetch>,
        storage: Arc<dyn RuleSetStorage>,
        proxy: Arc<ProxyHandler>,
        listener: Arc<dyn EventListener>,
        stop: Arc<StopSignal>,
    ) -> SyncHelper {
        SyncHelper {
            fetcher,
            storage,
            proxy,
            listener,
            stop,
            processor: ChangeProcessor::new(config.filter.clone()),
            checker: ChangeChecker,
            filter_query_string: config.filter_query_string(),
            max_attempts: config.on_demand_fetch_max_attempts.max(1),
            cdn_bypass_threshold: config.cdn_bypass_threshold,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            cache_expiration: config.cache_expiration,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one sync pass.
    pub fn sync(&self, target: SyncTarget) -> SyncOutcome {
        let _in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if self.stop.is_stopped() {
            return SyncOutcome::Cancelled;
        }

        let before = self.storage.change_numbers();
        if let SyncTarget::AtLeast(target) = target {
            if before.has_reached(&target) {
                log::debug!(target: "split",
                            flags = before.flags,
                            rule_based_segments = before.rule_based_segments;
                            "storage already at target change numbers");
                return SyncOutcome::Success(before);
            }
        }

        self.proxy.perform_proxy_check(Utc::now());
        let mut recovering = self.proxy.is_recovery_mode();
        let config_changed = self.config_changed(&self.storage.snapshot());
        let mut clear_pending = recovering || config_changed;
        let mut cleared = false;

        let backoff = BackoffCounter::new(self.backoff_base, self.backoff_cap);
        let mut attempt = 0;
        loop {
            if self.stop.is_stopped() {
                return SyncOutcome::Cancelled;
            }

            let spec = self.proxy.current_spec();
            let goal = sync_goal(target, spec);
            match self.fetch_round(spec, goal, attempt, &mut clear_pending, &mut cleared) {
                Ok(current) => {
                    if goal.map_or(true, |goal| current.has_reached(&goal)) {
                        if recovering {
                            self.proxy.reset_proxy_check_timestamp();
                        }
                        self.notify_success(before, current, cleared);
                        return SyncOutcome::Success(current);
                    }
                    log::debug!(target: "split",
                                attempt,
                                flags = current.flags,
                                rule_based_segments = current.rule_based_segments;
                                "fetched change numbers are behind target");
                }
                Err(Error::Fetch(FetchError::ProxyOutdated)) => {
                    self.proxy.track_proxy_error(Utc::now());
                    if recovering {
                        recovering = false;
                        clear_pending = config_changed && !cleared;
                    }
                }
                Err(Error::Fetch(err)) if !err.is_retryable() => {
                    log::warn!(target: "split", err:display; "fetching rule-set changes failed");
                    return self.give_up(true);
                }
                Err(err @ Error::StoragePoisoned) => {
                    log::warn!(target: "split", err:display; "cannot apply rule-set changes");
                    return self.give_up(true);
                }
                Err(err) => {
                    log::warn!(target: "split", attempt, err:display; "fetching rule-set changes failed");
                }
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                return self.give_up(false);
            }
            if self.stop.wait_timeout(backoff.next_delay()) {
                return SyncOutcome::Cancelled;
            }
        }
    }

    /// Apply a change set carried by a push notification without fetching.
    ///
    /// Runs under the same lock as [`SyncHelper::sync`]. `applies_to` is checked against the
    /// stored change numbers once the lock is held. Returns `None` when it doesn't hold or the
    /// change set could not be applied, in which case the caller should fetch instead.
    pub(crate) fn apply_notification(
        &self,
        wire: ChangeSetWire,
        applies_to: impl FnOnce(ChangeNumbers) -> bool,
    ) -> Option<SyncOutcome> {
        let _in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if self.stop.is_stopped() {
            return Some(SyncOutcome::Cancelled);
        }

        let snapshot = self.storage.snapshot();
        let before = snapshot.change_numbers();
        if !applies_to(before) {
            log::debug!(target: "split",
                        flags = before.flags,
                        rule_based_segments = before.rule_based_segments;
                        "storage moved before the notification could be applied");
            return None;
        }

        // In-place updates keep the spec version the stored rules were fetched with.
        let spec = snapshot.spec_version().unwrap_or(SyncConfig::LATEST_SPEC);
        let change_set = self.processor.process(wire, spec, Utc::now());
        if let Err(err) = self.storage.apply_atomically(&change_set, false) {
            log::warn!(target: "split", err:display; "failed to apply notification");
            return None;
        }

        let after = self.storage.change_numbers();
        log::debug!(target: "split",
                    flags = after.flags,
                    rule_based_segments = after.rule_based_segments;
                    "applied definition from notification");
        self.notify_success(before, after, false);
        Some(SyncOutcome::Success(after))
    }

    /// Clear storage if the stored rule set is older than the configured cache expiration.
    /// Returns whether storage was cleared.
    pub fn clear_expired_cache(&self, now: DateTime<Utc>) -> Result<bool> {
        let snapshot = self.storage.snapshot();
        let expired = snapshot.change_numbers().flags > -1
            && snapshot.updated_at().is_some_and(|updated_at| {
                (now - updated_at)
                    .to_std()
                    .is_ok_and(|age| age > self.cache_expiration)
            });

        if expired {
            log::debug!(target: "split",
                        updated_at:debug = snapshot.updated_at();
                        "cached rule set expired, clearing storage");
            self.storage.clear()?;
        }
        Ok(expired)
    }

    /// Fetch pages from the stored change numbers until the server reports nothing newer.
    fn fetch_round(
        &self,
        spec: &str,
        goal: Option<ChangeNumbers>,
        attempt: u32,
        clear_pending: &mut bool,
        cleared: &mut bool,
    ) -> Result<ChangeNumbers> {
        let till = goal
            .filter(|_| attempt >= self.cdn_bypass_threshold)
            .map(|goal| goal.flags.max(goal.rule_based_segments));

        loop {
            let current = if *clear_pending {
                ChangeNumbers::EMPTY
            } else {
                self.storage.change_numbers()
            };

            let params = FetchParams {
                spec: spec.to_owned(),
                since: current.flags,
                rule_based_segments_since: (spec != SyncConfig::LEGACY_SPEC)
                    .then_some(current.rule_based_segments),
                till,
                avoid_cache: attempt > 0,
            };
            let wire = self.fetcher.fetch(&params)?;
            let change_set = self.processor.process(wire, spec, Utc::now());

            if *clear_pending || !is_noop(&change_set, current) {
                self.storage.apply_atomically(&change_set, *clear_pending)?;
                *cleared |= *clear_pending;
                *clear_pending = false;
            }

            let after = self.storage.change_numbers();
            if change_set.is_caught_up() || after == current {
                return Ok(after);
            }
        }
    }

    /// Whether the stored rule set was fetched with a different filter or spec version.
    fn config_changed(&self, snapshot: &RuleSetSnapshot) -> bool {
        let filter_changed = snapshot.filter_query_string() != self.filter_query_string;
        // Legacy payloads are a subset of the latest spec, so fallback mode keeps stored rules.
        let spec_changed = !self.proxy.is_fallback_mode()
            && snapshot
                .spec_version()
                .is_some_and(|spec| spec != SyncConfig::LATEST_SPEC);

        if filter_changed || spec_changed {
            log::debug!(target: "split",
                        filter_changed,
                        spec_changed;
                        "stored rules were fetched with a different configuration, clearing");
        }
        filter_changed || spec_changed
    }

    fn notify_success(&self, before: ChangeNumbers, after: ChangeNumbers, cleared: bool) {
        let event = if cleared || self.checker.rule_set_changed(before, after) {
            SyncEvent::updated(after)
        } else {
            SyncEvent::fetched(after)
        };
        self.listener.on_event(event);
    }

    fn give_up(&self, do_not_retry: bool) -> SyncOutcome {
        log::warn!(target: "split", do_not_retry; "sync gave up before reaching its target");
        self.listener.on_event(SyncEvent::SyncExhausted { do_not_retry });
        if do_not_retry {
            SyncOutcome::DoNotRetry
        } else {
            SyncOutcome::Exhausted
        }
    }
}

/// Change numbers a pass must reach. The legacy spec carries no rule-based segments, so their
/// target is dropped in fallback mode.
fn sync_goal(target: SyncTarget, spec: &str) -> Option<ChangeNumbers> {
    match target {
        SyncTarget::Latest => None,
        SyncTarget::AtLeast(target) if spec == SyncConfig::LEGACY_SPEC => {
            Some(ChangeNumbers::new(target.flags, -1))
        }
        SyncTarget::AtLeast(target) => Some(target),
    }
}

/// A caught-up page with no entities at the stored change numbers doesn't need to be applied.
fn is_noop(change_set: &ChangeSet, current: ChangeNumbers) -> bool {
    change_set.is_caught_up()
        && change_set.is_empty()
        && change_set.flags.till == current.flags
        && change_set
            .rule_based_segments
            .as_ref()
            .map_or(true, |page| page.till == current.rule_based_segments)
}
