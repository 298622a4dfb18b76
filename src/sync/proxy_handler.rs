//! Wire spec selection for SDK instances talking to an outdated Split proxy.
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::config::SyncConfig;

/// Proxy compatibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyHandlingState {
    /// Use the latest spec.
    #[default]
    None,
    /// The proxy rejected the latest spec. Use the legacy spec and omit rule-based segments.
    Fallback,
    /// The check interval elapsed while in fallback. Try the latest spec again.
    Recovery,
}

/// Persistence of the last proxy check timestamp (milliseconds), so the check interval survives
/// restarts.
pub trait ProxyCheckStore: Send + Sync {
    fn last_proxy_check_timestamp(&self) -> i64;
    fn set_last_proxy_check_timestamp(&self, timestamp: i64);
}

/// [`ProxyCheckStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryProxyCheckStore {
    timestamp: AtomicI64,
}

impl ProxyCheckStore for InMemoryProxyCheckStore {
    fn last_proxy_check_timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    fn set_last_proxy_check_timestamp(&self, timestamp: i64) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
    }
}

pub struct ProxyHandler {
    store: Arc<dyn ProxyCheckStore>,
    check_interval: Duration,
    /// Background sync can't correct a bad guess interactively, so it always uses the latest spec.
    inert: bool,
    state: Mutex<ProxyHandlingState>,
}

impl ProxyHandler {
    pub fn new(store: Arc<dyn ProxyCheckStore>, check_interval: Duration) -> ProxyHandler {
        ProxyHandler {
            store,
            check_interval,
            inert: false,
            state: Mutex::new(ProxyHandlingState::None),
        }
    }

    /// Handler for background sync passes. Stays in [`ProxyHandlingState::None`].
    pub fn inert() -> ProxyHandler {
        ProxyHandler {
            store: Arc::new(InMemoryProxyCheckStore::default()),
            check_interval: Duration::ZERO,
            inert: true,
            state: Mutex::new(ProxyHandlingState::None),
        }
    }

    /// Pick the state for the next sync pass from the stored check timestamp.
    pub fn perform_proxy_check(&self, now: DateTime<Utc>) {
        if self.inert {
            return;
        }

        let last_check = self.store.last_proxy_check_timestamp();
        let state = if last_check == 0 {
            ProxyHandlingState::None
        } else if now.timestamp_millis() - last_check > self.check_interval_millis() {
            ProxyHandlingState::Recovery
        } else {
            ProxyHandlingState::Fallback
        };
        self.set_state(state);
    }

    /// Record a proxy incompatibility and switch to the legacy spec.
    pub fn track_proxy_error(&self, now: DateTime<Utc>) {
        if self.inert {
            return;
        }
        self.store.set_last_proxy_check_timestamp(now.timestamp_millis());
        self.set_state(ProxyHandlingState::Fallback);
    }

    /// The latest spec works again.
    pub fn reset_proxy_check_timestamp(&self) {
        if self.inert {
            return;
        }
        self.store.set_last_proxy_check_timestamp(0);
        self.set_state(ProxyHandlingState::None);
    }

    pub fn state(&self) -> ProxyHandlingState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.state() == ProxyHandlingState::Fallback
    }

    pub fn is_recovery_mode(&self) -> bool {
        self.state() == ProxyHandlingState::Recovery
    }

    /// Wire spec version to request in the current state.
    pub fn current_spec(&self) -> &'static str {
        if self.is_fallback_mode() {
            SyncConfig::LEGACY_SPEC
        } else {
            SyncConfig::LATEST_SPEC
        }
    }

    fn set_state(&self, state: ProxyHandlingState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            log::debug!(target: "split",
                        from:debug = *current,
                        to:debug = state;
                        "proxy handling state changed");
            *current = state;
        }
    }

    fn check_interval_millis(&self) -> i64 {
        i64::try_from(self.check_interval.as_millis()).unwrap_or(i64::MAX)
    }
}
