//! Storage collaborators: the rule set and segment membership.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    rules::{models::SegmentKind, FlagDefinition},
    snapshot::{ChangeNumbers, ChangeSet, RuleSetSnapshot},
    Error, Result,
};

/// Owner of the current [`RuleSetSnapshot`].
///
/// Implementations must publish new snapshots with a single swap: readers see either the
/// previous snapshot or the new one, never a mix.
pub trait RuleSetStorage: Send + Sync {
    /// Current snapshot.
    fn snapshot(&self) -> Arc<RuleSetSnapshot>;

    /// Apply `change_set` on top of the current snapshot (or on top of an empty one if
    /// `clear_first` is set) and publish the result.
    fn apply_atomically(&self, change_set: &ChangeSet, clear_first: bool) -> Result<()>;

    /// Mark a flag as killed with a new default treatment. Returns `false` if the flag is unknown
    /// or its stored change number is not older than `change_number`.
    fn kill_flag(&self, flag_name: &str, default_treatment: &str, change_number: i64)
        -> Result<bool>;

    /// Drop all rules, resetting change numbers to `-1`.
    fn clear(&self) -> Result<()>;

    fn change_numbers(&self) -> ChangeNumbers {
        self.snapshot().change_numbers()
    }

    fn get(&self, flag_name: &str) -> Option<Arc<FlagDefinition>> {
        self.snapshot().get(flag_name)
    }

    fn get_all(&self) -> HashMap<String, Arc<FlagDefinition>> {
        self.snapshot().get_all()
    }

    fn filter_query_string(&self) -> String {
        self.snapshot().filter_query_string().to_owned()
    }
}

/// In-memory [`RuleSetStorage`].
///
/// Readers only take the read lock long enough to clone an `Arc`. Writers are serialized by a
/// separate mutex so that building the next snapshot doesn't block readers.
pub struct InMemoryStorage {
    snapshot: RwLock<Arc<RuleSetSnapshot>>,
    writer: Mutex<()>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        InMemoryStorage::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::with_snapshot(RuleSetSnapshot::empty())
    }

    /// Create storage primed with a snapshot (e.g., one restored from disk).
    pub fn with_snapshot(snapshot: RuleSetSnapshot) -> InMemoryStorage {
        InMemoryStorage {
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// Build the next snapshot from the current one and publish it. `update` returning `None`
    /// leaves storage untouched.
    fn update(
        &self,
        update: impl FnOnce(&RuleSetSnapshot) -> Option<RuleSetSnapshot>,
    ) -> Result<bool> {
        let _writer = self.writer.lock().map_err(|_| Error::StoragePoisoned)?;

        let Some(next) = update(&self.snapshot()) else {
            return Ok(false);
        };
        // Constructing new value before requesting the lock to minimize lock span.
        let next = Arc::new(next);

        let mut slot = self.snapshot.write().map_err(|_| Error::StoragePoisoned)?;
        *slot = next;
        Ok(true)
    }
}

impl RuleSetStorage for InMemoryStorage {
    fn snapshot(&self) -> Arc<RuleSetSnapshot> {
        // The lock is only poisoned if a writer panicked while swapping the pointer, in which case
        // the slot still holds a complete snapshot.
        match self.snapshot.read() {
            Ok(snapshot) => Arc::clone(&snapshot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn apply_atomically(&self, change_set: &ChangeSet, clear_first: bool) -> Result<()> {
        self.update(|current| Some(current.apply(change_set, clear_first)))?;
        log::debug!(target: "split",
                    flags_till = change_set.till().flags,
                    rule_based_segments_till = change_set.till().rule_based_segments,
                    clear_first;
                    "applied change set");
        Ok(())
    }

    fn kill_flag(
        &self,
        flag_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> Result<bool> {
        self.update(|current| current.with_killed_flag(flag_name, default_treatment, change_number))
    }

    fn clear(&self) -> Result<()> {
        self.update(|_| Some(RuleSetSnapshot::empty()))?;
        Ok(())
    }
}

/// Segment membership lookups for the keys being evaluated.
///
/// Membership is synchronized separately from rules. Lookups must answer from local state only.
pub trait SegmentMembership: Send + Sync {
    /// Whether `key` belongs to a standard or large segment. Rule-based segments are resolved by
    /// the evaluator and never reach this trait.
    fn is_member(&self, key: &str, kind: SegmentKind, segment_name: &str) -> bool;
}

/// In-memory [`SegmentMembership`], keyed by matching key.
#[derive(Default)]
pub struct InMemorySegments {
    standard: RwLock<HashMap<String, HashSet<String>>>,
    large: RwLock<HashMap<String, HashSet<String>>>,
}

impl InMemorySegments {
    pub fn new() -> InMemorySegments {
        InMemorySegments::default()
    }

    /// Replace the segments `key` belongs to.
    pub fn set_segments(
        &self,
        key: &str,
        kind: SegmentKind,
        segments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let slot = match kind {
            SegmentKind::Standard => &self.standard,
            SegmentKind::Large => &self.large,
            SegmentKind::RuleBased => return Ok(()),
        };
        let segments = segments.into_iter().map(Into::into).collect();
        slot.write()
            .map_err(|_| Error::StoragePoisoned)?
            .insert(key.to_owned(), segments);
        Ok(())
    }
}

impl SegmentMembership for InMemorySegments {
    fn is_member(&self, key: &str, kind: SegmentKind, segment_name: &str) -> bool {
        let slot = match kind {
            SegmentKind::Standard => &self.standard,
            SegmentKind::Large => &self.large,
            SegmentKind::RuleBased => return false,
        };
        slot.read()
            .ok()
            .and_then(|memberships| Some(memberships.get(key)?.contains(segment_name)))
            .unwrap_or(false)
    }
}
