use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::{
    config::SplitFilter,
    rules::{
        compile_flag, compile_rule_based_segment, FlagEntry, RuleBasedSegmentEntry,
        models::{ChangePageWire, ChangeSetWire, RuleBasedSegmentWire, SplitWire, Status, TryParse},
    },
    snapshot::{ChangePage, ChangeSet},
};

/// Turns a fetched change set into one that can be applied to storage: compiles definitions,
/// classifies them as updated or archived, and applies the configured filter.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeProcessor {
    filter: Option<SplitFilter>,
}

impl ChangeProcessor {
    pub fn new(filter: Option<SplitFilter>) -> ChangeProcessor {
        ChangeProcessor { filter }
    }

    pub fn process(
        &self,
        wire: ChangeSetWire,
        spec_version: &str,
        fetched_at: DateTime<Utc>,
    ) -> ChangeSet {
        let (flags, rule_based_segments) = match wire {
            ChangeSetWire::Targeting(wire) => (
                self.process_flags(wire.ff),
                // A missing page leaves stored segments alone, as with the legacy spec.
                wire.rbs.map(process_rule_based_segments),
            ),
            ChangeSetWire::Legacy(wire) => (
                self.process_flags(ChangePageWire {
                    entities: wire.splits,
                    since: wire.since,
                    till: wire.till,
                }),
                None,
            ),
        };

        ChangeSet {
            flags,
            rule_based_segments,
            filter_query_string: self
                .filter
                .as_ref()
                .map(SplitFilter::query_string)
                .unwrap_or_default(),
            spec_version: spec_version.to_owned(),
            fetched_at,
        }
    }

    fn process_flags(&self, wire: ChangePageWire<SplitWire>) -> ChangePage<FlagEntry> {
        let mut page = ChangePage::new(wire.since, wire.till);

        for flag in wire.entities.into_iter().filter_map(parsed("flag")) {
            let Some(name) = flag.name.clone() else {
                continue;
            };

            match &self.filter {
                Some(SplitFilter::ByNames(names)) if !names.contains(&name) => continue,
                Some(SplitFilter::BySets(sets)) if !intersects(flag.sets.as_ref(), sets) => {
                    page.archived.push(name);
                    continue;
                }
                _ => {}
            }

            if flag.status != Status::Active {
                page.archived.push(name);
                continue;
            }

            match compile_flag(name.clone(), flag) {
                Some(entry) => page.updated.push((name, entry)),
                None => page.archived.push(name),
            }
        }

        page
    }
}

fn process_rule_based_segments(
    wire: ChangePageWire<RuleBasedSegmentWire>,
) -> ChangePage<RuleBasedSegmentEntry> {
    let mut page = ChangePage::new(wire.since, wire.till);

    for segment in wire.entities.into_iter().filter_map(parsed("rule-based segment")) {
        let Some(name) = segment.name.clone() else {
            continue;
        };
        if segment.status == Status::Active {
            let entry = compile_rule_based_segment(name.clone(), segment);
            page.updated.push((name, entry));
        } else {
            page.archived.push(name);
        }
    }

    page
}

fn intersects(flag_sets: Option<&HashSet<String>>, filter_sets: &[String]) -> bool {
    flag_sets.is_some_and(|flag_sets| filter_sets.iter().any(|set| flag_sets.contains(set)))
}

/// Drop entities that failed to parse, logging a warning.
fn parsed<T>(kind: &'static str) -> impl Fn(TryParse<T>) -> Option<T> {
    move |entity| match entity {
        TryParse::Parsed(entity) => Some(entity),
        TryParse::ParseFailed(value) => {
            log::warn!(target: "split",
                       kind,
                       name:debug = value.get("name");
                       "dropping malformed {kind} definition");
            None
        }
    }
}
