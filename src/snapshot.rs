//! Immutable view of the rule set.
use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};

use crate::rules::{
    FlagDefinition, FlagEntry, RuleBasedSegment, RuleBasedSegmentEntry,
};

/// Change numbers of flags and rule-based segments. `-1` means nothing has been synced yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeNumbers {
    pub flags: i64,
    pub rule_based_segments: i64,
}

impl ChangeNumbers {
    /// Change numbers of an empty rule set.
    pub const EMPTY: ChangeNumbers = ChangeNumbers {
        flags: -1,
        rule_based_segments: -1,
    };

    pub fn new(flags: i64, rule_based_segments: i64) -> ChangeNumbers {
        ChangeNumbers {
            flags,
            rule_based_segments,
        }
    }

    /// Whether both change numbers are at or past `target`.
    pub fn has_reached(&self, target: &ChangeNumbers) -> bool {
        self.flags >= target.flags && self.rule_based_segments >= target.rule_based_segments
    }
}

impl Default for ChangeNumbers {
    fn default() -> Self {
        ChangeNumbers::EMPTY
    }
}

/// Changes to one entity type, as processed from a single fetch.
#[derive(Debug, Clone)]
pub(crate) struct ChangePage<T> {
    pub since: i64,
    pub till: i64,
    pub(crate) updated: Vec<(String, T)>,
    pub(crate) archived: Vec<String>,
}

impl<T> ChangePage<T> {
    pub(crate) fn new(since: i64, till: i64) -> ChangePage<T> {
        ChangePage {
            since,
            till,
            updated: Vec::new(),
            archived: Vec::new(),
        }
    }

    /// Number of updated and archived entities.
    pub fn len(&self) -> usize {
        self.updated.len() + self.archived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the entities updated by this page.
    pub fn updated_names(&self) -> impl Iterator<Item = &str> {
        self.updated.iter().map(|(name, _)| name.as_str())
    }

    /// Names of the entities removed by this page.
    pub fn archived_names(&self) -> impl Iterator<Item = &str> {
        self.archived.iter().map(String::as_str)
    }
}

/// A processed change set, ready to be applied to a [`RuleSetSnapshot`].
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub(crate) flags: ChangePage<FlagEntry>,
    /// `None` when the payload had no rule-based segments page, which is always the case with
    /// the legacy wire spec. Stored segments are left untouched then.
    pub(crate) rule_based_segments: Option<ChangePage<RuleBasedSegmentEntry>>,
    pub(crate) filter_query_string: String,
    pub(crate) spec_version: String,
    pub(crate) fetched_at: DateTime<Utc>,
}

impl ChangeSet {
    /// Names of the flags added or updated by this change set.
    pub fn updated_flag_names(&self) -> impl Iterator<Item = &str> {
        self.flags.updated_names()
    }

    /// Names of the flags removed by this change set.
    pub fn archived_flag_names(&self) -> impl Iterator<Item = &str> {
        self.flags.archived_names()
    }

    /// `since` of both pages. Rule-based segments report `-1` when the page is missing.
    pub fn since(&self) -> ChangeNumbers {
        ChangeNumbers::new(
            self.flags.since,
            self.rule_based_segments.as_ref().map_or(-1, |page| page.since),
        )
    }

    /// `till` of both pages. Rule-based segments report `-1` when the page is missing.
    pub fn till(&self) -> ChangeNumbers {
        ChangeNumbers::new(
            self.flags.till,
            self.rule_based_segments.as_ref().map_or(-1, |page| page.till),
        )
    }

    /// The server has nothing newer than `since` for every entity type in this change set.
    pub fn is_caught_up(&self) -> bool {
        self.flags.since == self.flags.till
            && self
                .rule_based_segments
                .as_ref()
                .map_or(true, |page| page.since == page.till)
    }

    /// No entity is added, updated or removed.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
            && self
                .rule_based_segments
                .as_ref()
                .map_or(true, ChangePage::is_empty)
    }
}

/// Immutable view of all flags and rule-based segments.
///
/// Snapshots are never mutated in place. Updates build a new snapshot that storage publishes with
/// a single pointer swap, so an evaluation always sees one consistent rule set.
#[derive(Debug, Clone)]
pub struct RuleSetSnapshot {
    pub(crate) flags: HashMap<String, FlagEntry>,
    pub(crate) rule_based_segments: HashMap<String, RuleBasedSegmentEntry>,
    pub(crate) change_numbers: ChangeNumbers,
    pub(crate) filter_query_string: String,
    pub(crate) spec_version: Option<String>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
}

impl Default for RuleSetSnapshot {
    fn default() -> Self {
        RuleSetSnapshot::empty()
    }
}

impl RuleSetSnapshot {
    /// A snapshot with no rules and change numbers at `-1`.
    pub fn empty() -> RuleSetSnapshot {
        RuleSetSnapshot {
            flags: HashMap::new(),
            rule_based_segments: HashMap::new(),
            change_numbers: ChangeNumbers::EMPTY,
            filter_query_string: String::new(),
            spec_version: None,
            updated_at: None,
        }
    }

    pub fn change_numbers(&self) -> ChangeNumbers {
        self.change_numbers
    }

    /// Flag filter the stored flags were fetched with.
    pub fn filter_query_string(&self) -> &str {
        &self.filter_query_string
    }

    /// Wire spec version the stored rules were fetched with.
    pub fn spec_version(&self) -> Option<&str> {
        self.spec_version.as_deref()
    }

    /// When a change set was last applied.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Get a flag. Flags that failed to compile are not returned.
    pub fn get(&self, flag_name: &str) -> Option<Arc<FlagDefinition>> {
        self.flags.get(flag_name)?.as_ref().ok().cloned()
    }

    /// All flags that compiled successfully.
    pub fn get_all(&self) -> HashMap<String, Arc<FlagDefinition>> {
        self.flags
            .iter()
            .filter_map(|(name, entry)| Some((name.clone(), entry.as_ref().ok()?.clone())))
            .collect()
    }

    /// Names of all stored flags, including the ones that failed to compile.
    pub fn flag_names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    /// Names of flags belonging to any of `sets`, sorted.
    pub fn flag_names_by_sets(&self, sets: &[&str]) -> Vec<String> {
        let mut names: Vec<String> = self
            .get_all()
            .into_values()
            .filter(|flag| sets.iter().any(|set| flag.sets.contains(*set)))
            .map(|flag| flag.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn rule_based_segment(&self, name: &str) -> Option<Arc<RuleBasedSegment>> {
        self.rule_based_segments.get(name)?.as_ref().ok().cloned()
    }

    pub(crate) fn flag_entry(&self, flag_name: &str) -> Option<&FlagEntry> {
        self.flags.get(flag_name)
    }

    pub(crate) fn rule_based_segment_entry(&self, name: &str) -> Option<&RuleBasedSegmentEntry> {
        self.rule_based_segments.get(name)
    }

    /// Build the snapshot that results from applying `change_set`.
    ///
    /// With `clear_first`, stored rules are dropped before the change set is applied. Otherwise a
    /// page whose `till` is behind the stored change number is skipped, so change numbers never
    /// go backwards.
    pub fn apply(&self, change_set: &ChangeSet, clear_first: bool) -> RuleSetSnapshot {
        let mut next = if clear_first {
            RuleSetSnapshot::empty()
        } else {
            self.clone()
        };

        if change_set.flags.till >= next.change_numbers.flags {
            for name in &change_set.flags.archived {
                next.flags.remove(name);
            }
            for (name, entry) in &change_set.flags.updated {
                next.flags.insert(name.clone(), entry.clone());
            }
            next.change_numbers.flags = change_set.flags.till;
        } else {
            log::debug!(target: "split",
                        till = change_set.flags.till,
                        stored = next.change_numbers.flags;
                        "skipping outdated flags page");
        }

        if let Some(page) = &change_set.rule_based_segments {
            if page.till >= next.change_numbers.rule_based_segments {
                for name in &page.archived {
                    next.rule_based_segments.remove(name);
                }
                for (name, entry) in &page.updated {
                    next.rule_based_segments.insert(name.clone(), entry.clone());
                }
                next.change_numbers.rule_based_segments = page.till;
            } else {
                log::debug!(target: "split",
                            till = page.till,
                            stored = next.change_numbers.rule_based_segments;
                            "skipping outdated rule-based segments page");
            }
        }

        next.filter_query_string = change_set.filter_query_string.clone();
        next.spec_version = Some(change_set.spec_version.clone());
        next.updated_at = Some(change_set.fetched_at);
        next
    }

    /// Build the snapshot with `flag_name` killed. Returns `None` if the flag is unknown or
    /// already at or past `change_number`.
    pub fn with_killed_flag(
        &self,
        flag_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> Option<RuleSetSnapshot> {
        let flag = self.get(flag_name)?;
        if flag.change_number >= change_number {
            return None;
        }

        let mut killed = FlagDefinition::clone(&flag);
        killed.killed = true;
        killed.default_treatment = default_treatment.to_owned();
        killed.change_number = change_number;

        let mut next = self.clone();
        next.flags.insert(flag_name.to_owned(), Ok(Arc::new(killed)));
        Some(next)
    }
}
