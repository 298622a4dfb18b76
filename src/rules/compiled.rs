//! Compilation of wire definitions into the evaluation model.
//!
//! Compilation happens once, when a change set is applied, so evaluation never parses regexes or
//! versions and never sees a half-valid definition.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use regex::Regex;
use semver::Version;

use crate::{
    error::EvaluationFailure,
    eval::labels,
    hasher::Algo,
    rules::{
        matchers::{Matcher, MatcherKind},
        models::{
            ConditionType, ConditionWire, ExcludedSegmentWire, MatcherType, MatcherWire,
            PartitionWire, RuleBasedSegmentWire, SegmentKind, SplitWire,
        },
    },
};

/// Flags with more conditions than this are dropped.
pub(crate) const CONDITIONS_UPPER_LIMIT: usize = 50;

/// Treatment reserved for "no answer".
pub const CONTROL: &str = "control";

pub(crate) type FlagEntry = Result<Arc<FlagDefinition>, EvaluationFailure>;
pub(crate) type RuleBasedSegmentEntry = Result<Arc<RuleBasedSegment>, EvaluationFailure>;

/// A compiled feature flag.
#[derive(Debug, Clone)]
pub struct FlagDefinition {
    pub name: String,
    pub traffic_type_name: Option<String>,
    pub seed: i32,
    /// Percentage (0 to 100) of keys that rollout conditions apply to.
    pub traffic_allocation: i32,
    pub traffic_allocation_seed: i32,
    pub killed: bool,
    pub default_treatment: String,
    pub change_number: i64,
    pub algo: Algo,
    pub sets: HashSet<String>,
    /// Treatment name to JSON-encoded configuration.
    pub configurations: HashMap<String, String>,
    pub conditions: Vec<Condition>,
    pub prerequisites: Vec<Prerequisite>,
}

impl FlagDefinition {
    /// All treatments this flag can return, in order of first appearance.
    pub fn treatments(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.conditions
            .iter()
            .flat_map(|condition| condition.partitions.iter())
            .map(|partition| partition.treatment.as_str())
            .chain(std::iter::once(self.default_treatment.as_str()))
            .filter(|treatment| seen.insert(*treatment))
            .collect()
    }

    pub(crate) fn configuration_for(&self, treatment: &str) -> Option<String> {
        self.configurations.get(treatment).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub label: String,
    pub partitions: Vec<Partition>,
    pub(crate) matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub treatment: String,
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    pub flag_name: String,
    pub treatments: HashSet<String>,
}

/// A compiled rule-based segment.
#[derive(Debug, Clone)]
pub struct RuleBasedSegment {
    pub name: String,
    pub traffic_type_name: Option<String>,
    pub change_number: i64,
    pub excluded_keys: HashSet<String>,
    pub excluded_segments: Vec<(SegmentKind, String)>,
    pub conditions: Vec<Condition>,
}

/// Compile a flag definition. Returns `None` for a definition that must be dropped.
///
/// A definition that cannot be compiled is kept as an [`EvaluationFailure`] so that evaluating
/// it reports an exception rather than "not found".
pub(crate) fn compile_flag(name: String, wire: SplitWire) -> Option<FlagEntry> {
    if wire.conditions.len() > CONDITIONS_UPPER_LIMIT {
        log::warn!(target: "split",
                   flag_name:display = name,
                   conditions = wire.conditions.len();
                   "dropping flag due to large number of conditions");
        return None;
    }

    let change_number = wire.change_number;
    let conditions = compile_conditions(wire.conditions).map_err(|reason| {
        log::warn!(target: "split",
                   flag_name:display = name,
                   change_number,
                   reason:display = reason;
                   "failed to compile flag");
        EvaluationFailure::MalformedDefinition {
            change_number: Some(change_number),
            reason,
        }
    });
    let conditions = match conditions {
        Ok(conditions) => conditions,
        Err(failure) => return Some(Err(failure)),
    };

    Some(Ok(Arc::new(FlagDefinition {
        name,
        traffic_type_name: wire.traffic_type_name,
        seed: wire.seed,
        traffic_allocation: wire.traffic_allocation.unwrap_or(100).clamp(0, 100),
        traffic_allocation_seed: wire.traffic_allocation_seed.unwrap_or(0),
        killed: wire.killed,
        default_treatment: wire
            .default_treatment
            .unwrap_or_else(|| CONTROL.to_owned()),
        change_number,
        algo: wire.algo.unwrap_or_default(),
        sets: wire.sets.unwrap_or_default(),
        configurations: wire.configurations.unwrap_or_default(),
        conditions,
        prerequisites: wire
            .prerequisites
            .into_iter()
            .map(|prerequisite| Prerequisite {
                flag_name: prerequisite.flag_name,
                treatments: prerequisite.treatments.into_iter().collect(),
            })
            .collect(),
    })))
}

pub(crate) fn compile_rule_based_segment(
    name: String,
    wire: RuleBasedSegmentWire,
) -> RuleBasedSegmentEntry {
    let change_number = wire.change_number;
    let conditions = compile_conditions(wire.conditions).map_err(|reason| {
        log::warn!(target: "split",
                   segment_name:display = name,
                   change_number,
                   reason:display = reason;
                   "failed to compile rule-based segment");
        EvaluationFailure::MalformedDefinition {
            change_number: Some(change_number),
            reason,
        }
    })?;

    Ok(Arc::new(RuleBasedSegment {
        name,
        traffic_type_name: wire.traffic_type_name,
        change_number,
        excluded_keys: wire.excluded.keys,
        excluded_segments: wire
            .excluded
            .segments
            .into_iter()
            .map(|segment| match segment {
                ExcludedSegmentWire::Typed { name, kind } => (kind, name),
                ExcludedSegmentWire::Name(name) => (SegmentKind::Standard, name),
            })
            .collect(),
        conditions,
    }))
}

/// Compile all conditions. A single unsupported matcher anywhere replaces the whole list with the
/// built-in unsupported condition.
fn compile_conditions(wires: Vec<ConditionWire>) -> Result<Vec<Condition>, String> {
    let mut conditions = Vec::with_capacity(wires.len());
    for wire in wires {
        match compile_condition(wire)? {
            Some(condition) => conditions.push(condition),
            None => return Ok(vec![unsupported_matcher_condition()]),
        }
    }
    Ok(conditions)
}

/// Returns `Ok(None)` if the condition uses a matcher that is not supported.
fn compile_condition(wire: ConditionWire) -> Result<Option<Condition>, String> {
    let mut matchers = Vec::with_capacity(wire.matcher_group.matchers.len());
    for matcher in wire.matcher_group.matchers {
        match compile_matcher(matcher)? {
            Some(matcher) => matchers.push(matcher),
            None => return Ok(None),
        }
    }

    Ok(Some(Condition {
        condition_type: wire.condition_type,
        label: wire.label.unwrap_or_default(),
        partitions: wire
            .partitions
            .into_iter()
            .map(|PartitionWire { treatment, size }| Partition { treatment, size })
            .collect(),
        matchers,
    }))
}

/// Condition substituted for conditions with unsupported matchers: everyone gets `control`.
fn unsupported_matcher_condition() -> Condition {
    Condition {
        condition_type: ConditionType::Whitelist,
        label: labels::UNSUPPORTED_MATCHER_TYPE.to_owned(),
        partitions: vec![Partition {
            treatment: CONTROL.to_owned(),
            size: 100,
        }],
        matchers: vec![Matcher {
            attribute: None,
            negate: false,
            kind: MatcherKind::AllKeys,
        }],
    }
}

/// Returns `Ok(None)` for unsupported matcher types and for known types missing their payload.
/// Returns `Err` for payloads that are present but invalid.
fn compile_matcher(wire: MatcherWire) -> Result<Option<Matcher>, String> {
    let to_set = |values: Vec<String>| values.into_iter().collect::<HashSet<_>>();
    let whitelist = wire.whitelist_matcher_data.map(|data| data.whitelist);
    let segment_name = wire
        .user_defined_segment_matcher_data
        .map(|data| data.segment_name);
    let unary = wire
        .unary_numeric_matcher_data
        .map(|data| (data.data_type.unwrap_or_default(), data.value));
    let between = wire
        .between_matcher_data
        .map(|data| (data.data_type.unwrap_or_default(), data.start, data.end));

    let kind = match wire.matcher_type {
        MatcherType::AllKeys => Some(MatcherKind::AllKeys),
        MatcherType::InSegment => segment_name.map(MatcherKind::InSegment),
        MatcherType::InRuleBasedSegment => segment_name.map(MatcherKind::InRuleBasedSegment),
        MatcherType::InLargeSegment => wire
            .user_defined_large_segment_matcher_data
            .map(|data| MatcherKind::InLargeSegment(data.large_segment_name)),
        MatcherType::Whitelist => whitelist.map(to_set).map(MatcherKind::Whitelist),
        MatcherType::EqualTo => unary.map(|(data_type, value)| MatcherKind::EqualTo(data_type, value)),
        MatcherType::GreaterThanOrEqualTo => {
            unary.map(|(data_type, value)| MatcherKind::GreaterThanOrEqualTo(data_type, value))
        }
        MatcherType::LessThanOrEqualTo => {
            unary.map(|(data_type, value)| MatcherKind::LessThanOrEqualTo(data_type, value))
        }
        MatcherType::Between => {
            between.map(|(data_type, start, end)| MatcherKind::Between(data_type, start, end))
        }
        MatcherType::EqualToSet => whitelist.map(to_set).map(MatcherKind::EqualToSet),
        MatcherType::PartOfSet => whitelist.map(to_set).map(MatcherKind::PartOfSet),
        MatcherType::ContainsAllOfSet => whitelist.map(to_set).map(MatcherKind::ContainsAllOfSet),
        MatcherType::ContainsAnyOfSet => whitelist.map(to_set).map(MatcherKind::ContainsAnyOfSet),
        MatcherType::StartsWith => whitelist.map(MatcherKind::StartsWith),
        MatcherType::EndsWith => whitelist.map(MatcherKind::EndsWith),
        MatcherType::ContainsString => whitelist.map(MatcherKind::ContainsString),
        MatcherType::MatchesString => match wire.string_matcher_data {
            Some(pattern) => Some(MatcherKind::MatchesString(
                Regex::new(&pattern).map_err(|err| format!("invalid regex {pattern:?}: {err}"))?,
            )),
            None => None,
        },
        MatcherType::InSplitTreatment => {
            wire.dependency_matcher_data
                .map(|data| MatcherKind::InSplitTreatment {
                    flag_name: data.split,
                    treatments: to_set(data.treatments),
                })
        }
        MatcherType::EqualToBoolean => wire.boolean_matcher_data.map(MatcherKind::EqualToBoolean),
        MatcherType::EqualToSemver => wire
            .string_matcher_data
            .map(|v| MatcherKind::EqualToSemver(parse_version(&v))),
        MatcherType::GreaterThanOrEqualToSemver => wire
            .string_matcher_data
            .map(|v| MatcherKind::GreaterThanOrEqualToSemver(parse_version(&v))),
        MatcherType::LessThanOrEqualToSemver => wire
            .string_matcher_data
            .map(|v| MatcherKind::LessThanOrEqualToSemver(parse_version(&v))),
        MatcherType::BetweenSemver => wire.between_string_matcher_data.map(|data| {
            MatcherKind::BetweenSemver(parse_version(&data.start), parse_version(&data.end))
        }),
        MatcherType::InListSemver => whitelist.map(|versions| {
            MatcherKind::InListSemver(versions.iter().filter_map(|v| parse_version(v)).collect())
        }),
        MatcherType::Unsupported => None,
    };

    let Some(kind) = kind else {
        log::warn!(target: "split",
                   matcher_type:debug = wire.matcher_type;
                   "unsupported matcher, flag will evaluate to control");
        return Ok(None);
    };

    Ok(Some(Matcher {
        attribute: wire.key_selector.and_then(|selector| selector.attribute),
        negate: wire.negate,
        kind,
    }))
}

fn parse_version(version: &str) -> Option<Version> {
    Version::parse(version.trim())
        .map_err(|err| {
            log::warn!(target: "split", version, err:display; "invalid semver in matcher");
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use crate::{
        eval::labels,
        rules::models::{ConditionType, SplitWire},
    };

    use super::{compile_flag, CONDITIONS_UPPER_LIMIT, CONTROL};

    fn wire(json: &str) -> SplitWire {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn applies_defaults() {
        let flag = compile_flag(
            "f".to_owned(),
            wire(r#"{"name": "f", "status": "ACTIVE", "changeNumber": 5}"#),
        )
        .unwrap()
        .unwrap();
        assert_eq!(flag.traffic_allocation, 100);
        assert_eq!(flag.default_treatment, CONTROL);
        assert_eq!(flag.change_number, 5);
    }

    #[test]
    fn unsupported_matcher_replaces_all_conditions() {
        let flag = compile_flag(
            "f".to_owned(),
            wire(
                r#"{
                  "name": "f", "status": "ACTIVE", "changeNumber": 5, "defaultTreatment": "off",
                  "conditions": [
                    {"conditionType": "ROLLOUT", "label": "all",
                     "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "ALL_KEYS"}]},
                     "partitions": [{"treatment": "on", "size": 100}]},
                    {"conditionType": "ROLLOUT", "label": "new",
                     "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "IN_GALAXY"}]},
                     "partitions": [{"treatment": "on", "size": 100}]}
                  ]
                }"#,
            ),
        )
        .unwrap()
        .unwrap();

        assert_eq!(flag.conditions.len(), 1);
        let condition = &flag.conditions[0];
        assert_eq!(condition.condition_type, ConditionType::Whitelist);
        assert_eq!(condition.label, labels::UNSUPPORTED_MATCHER_TYPE);
        assert_eq!(condition.partitions[0].treatment, CONTROL);
        assert_eq!(condition.partitions[0].size, 100);
    }

    #[test]
    fn invalid_regex_is_a_malformed_definition() {
        let entry = compile_flag(
            "f".to_owned(),
            wire(
                r#"{
                  "name": "f", "status": "ACTIVE", "changeNumber": 9,
                  "conditions": [
                    {"matcherGroup": {"matchers": [{"matcherType": "MATCHES_STRING", "stringMatcherData": "(["}]},
                     "partitions": [{"treatment": "on", "size": 100}]}
                  ]
                }"#,
            ),
        )
        .unwrap();
        assert!(entry.is_err());
    }

    #[test]
    fn drops_flags_with_too_many_conditions() {
        let condition = r#"{"matcherGroup": {"matchers": [{"matcherType": "ALL_KEYS"}]}, "partitions": [{"treatment": "on", "size": 100}]}"#;
        let conditions = vec![condition; CONDITIONS_UPPER_LIMIT + 1].join(",");
        let json = format!(r#"{{"name": "f", "status": "ACTIVE", "conditions": [{conditions}]}}"#);
        assert!(compile_flag("f".to_owned(), wire(&json)).is_none());
    }

    #[test]
    fn treatments_are_collected_once() {
        let flag = compile_flag(
            "f".to_owned(),
            wire(
                r#"{
                  "name": "f", "status": "ACTIVE", "defaultTreatment": "off",
                  "conditions": [
                    {"matcherGroup": {"matchers": [{"matcherType": "ALL_KEYS"}]},
                     "partitions": [{"treatment": "on", "size": 50}, {"treatment": "off", "size": 50}]}
                  ]
                }"#,
            ),
        )
        .unwrap()
        .unwrap();
        assert_eq!(flag.treatments(), vec!["on", "off"]);
    }
}
