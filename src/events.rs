use serde::{Deserialize, Serialize};

use crate::snapshot::ChangeNumbers;

/// Signals raised by synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SyncEvent {
    /// Storage now holds a newer rule set.
    RuleSetUpdated { flags: i64, rule_based_segments: i64 },
    /// A fetch completed but brought nothing newer.
    RuleSetFetched { flags: i64, rule_based_segments: i64 },
    /// Sync gave up before reaching its target. With `do_not_retry`, retrying the same request
    /// cannot succeed (e.g., the request URI is too long) and periodic retries should stop.
    SyncExhausted { do_not_retry: bool },
}

impl SyncEvent {
    pub(crate) fn updated(change_numbers: ChangeNumbers) -> SyncEvent {
        SyncEvent::RuleSetUpdated {
            flags: change_numbers.flags,
            rule_based_segments: change_numbers.rule_based_segments,
        }
    }

    pub(crate) fn fetched(change_numbers: ChangeNumbers) -> SyncEvent {
        SyncEvent::RuleSetFetched {
            flags: change_numbers.flags,
            rule_based_segments: change_numbers.rule_based_segments,
        }
    }
}

/// Receives [`SyncEvent`]s. Called on the sync thread, so implementations should return quickly.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: SyncEvent);
}

pub(crate) struct NoopEventListener;
impl EventListener for NoopEventListener {
    fn on_event(&self, _event: SyncEvent) {}
}

impl<T: Fn(SyncEvent) + Send + Sync> EventListener for T {
    fn on_event(&self, event: SyncEvent) {
        self(event);
    }
}
