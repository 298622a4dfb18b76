use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::config::SyncConfig;

/// Forces a refresh when streaming has been silent for longer than the max sync period.
///
/// Push messages can be lost without the connection dropping. The guardian lets the coordinator
/// catch up on those when the host comes back to the foreground.
pub struct SyncGuardian {
    default_max_sync_period: Duration,
    sync_enabled: bool,
    streaming_enabled: bool,
    state: Mutex<GuardianState>,
}

#[derive(Debug, Default)]
struct GuardianState {
    /// Streaming connected at least once.
    initialized: bool,
    max_sync_period: Duration,
    last_sync: Option<DateTime<Utc>>,
}

impl SyncGuardian {
    pub fn new(config: &SyncConfig) -> SyncGuardian {
        SyncGuardian {
            default_max_sync_period: config.max_sync_period,
            sync_enabled: config.sync_enabled,
            streaming_enabled: config.streaming_enabled,
            state: Mutex::new(GuardianState {
                max_sync_period: config.max_sync_period,
                ..GuardianState::default()
            }),
        }
    }

    /// Called once streaming is up. Until then the guardian never asks for a sync.
    pub fn initialize(&self) {
        self.lock().initialized = true;
    }

    pub fn update_last_sync_timestamp(&self, now: DateTime<Utc>) {
        self.lock().last_sync = Some(now);
    }

    /// Apply a server-pushed period hint. Hints below the configured default are ignored.
    pub fn set_max_sync_period(&self, period: Duration) {
        let mut state = self.lock();
        state.max_sync_period = period.max(self.default_max_sync_period);
    }

    pub fn must_sync(&self, now: DateTime<Utc>) -> bool {
        if !self.sync_enabled || !self.streaming_enabled {
            return false;
        }

        let state = self.lock();
        if !state.initialized {
            return false;
        }

        match state.last_sync {
            None => true,
            Some(last_sync) => (now - last_sync)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= state.max_sync_period),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardianState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use crate::SyncConfig;

    use super::SyncGuardian;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn guardian(configure: impl FnOnce(&mut SyncConfig)) -> SyncGuardian {
        let mut config = SyncConfig::from_sdk_key("key");
        config.max_sync_period(Duration::from_millis(1000));
        configure(&mut config);
        SyncGuardian::new(&config)
    }

    #[test]
    fn never_syncs_when_sync_or_streaming_is_disabled() {
        for guardian in [
            guardian(|config| {
                config.sync_enabled(false);
            }),
            guardian(|config| {
                config.streaming_enabled(false);
            }),
        ] {
            guardian.initialize();
            guardian.update_last_sync_timestamp(at(2000));
            assert!(!guardian.must_sync(at(10_000)));
        }
    }

    #[test]
    fn syncs_once_max_period_elapsed() {
        let guardian = guardian(|_| {});
        guardian.initialize();
        guardian.update_last_sync_timestamp(at(1000));

        assert!(!guardian.must_sync(at(1500)));
        assert!(guardian.must_sync(at(2000)));
        assert!(guardian.must_sync(at(2001)));
    }

    #[test]
    fn period_hint_only_raises_the_period() {
        let lowered = guardian(|_| {});
        lowered.initialize();
        lowered.set_max_sync_period(Duration::from_millis(500));
        lowered.update_last_sync_timestamp(at(1000));
        assert!(!lowered.must_sync(at(1500)));

        let raised = guardian(|_| {});
        raised.initialize();
        raised.set_max_sync_period(Duration::from_millis(2000));
        raised.update_last_sync_timestamp(at(1000));
        assert!(!raised.must_sync(at(2500)));
        assert!(raised.must_sync(at(3000)));
    }

    #[test]
    fn not_initialized_never_syncs() {
        let guardian = guardian(|_| {});
        assert!(!guardian.must_sync(at(3000)));
        assert!(!guardian.must_sync(at(3000)));
        guardian.initialize();
        assert!(guardian.must_sync(at(3000)));
    }
}
