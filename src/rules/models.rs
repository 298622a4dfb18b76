//! Wire format of flags, rule-based segments and change sets, as served by the `splitChanges`
//! endpoint.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::hasher::Algo;

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// This isolates errors to a single entity: if one flag in a change set has an unexpected shape,
/// the rest of the change set is still applied.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Result<T, serde_json::Value> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Ok(v),
            TryParse::ParseFailed(v) => Err(v),
        }
    }
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Response of the `splitChanges` endpoint.
///
/// Spec `1.3` nests flags under `ff` and rule-based segments under `rbs`. Spec `1.2` (served by
/// outdated proxies) only knows about flags.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ChangeSetWire {
    Targeting(TargetingRulesChangeWire),
    Legacy(SplitChangeWire),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetingRulesChangeWire {
    pub ff: ChangePageWire<SplitWire>,
    #[serde(default)]
    pub rbs: Option<ChangePageWire<RuleBasedSegmentWire>>,
}

/// One page of changes for a single entity type.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChangePageWire<T> {
    #[serde(rename = "d", default = "Vec::new")]
    pub entities: Vec<TryParse<T>>,
    #[serde(rename = "s")]
    pub since: i64,
    #[serde(rename = "t")]
    pub till: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SplitChangeWire {
    #[serde(default)]
    pub splits: Vec<TryParse<SplitWire>>,
    pub since: i64,
    pub till: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Archived,
    #[serde(other)]
    Unknown,
}

/// Feature flag definition ("split").
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SplitWire {
    /// Entities without a name are dropped by the change processor.
    pub name: Option<String>,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default)]
    pub seed: i32,
    /// Missing allocation means 100%.
    #[serde(default)]
    pub traffic_allocation: Option<i32>,
    #[serde(default)]
    pub traffic_allocation_seed: Option<i32>,
    pub status: Status,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub default_treatment: Option<String>,
    #[serde(default)]
    pub change_number: i64,
    #[serde(default)]
    pub algo: Option<Algo>,
    #[serde(default)]
    pub sets: Option<HashSet<String>>,
    /// Treatment name to JSON-encoded configuration.
    #[serde(default)]
    pub configurations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub conditions: Vec<ConditionWire>,
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PrerequisiteWire {
    #[serde(rename = "n")]
    pub flag_name: String,
    #[serde(rename = "ts", default)]
    pub treatments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Whitelist,
    #[default]
    Rollout,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConditionWire {
    #[serde(default)]
    pub condition_type: ConditionType,
    pub matcher_group: MatcherGroupWire,
    #[serde(default)]
    pub partitions: Vec<PartitionWire>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Matchers of a condition. The combiner is always `AND`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroupWire {
    #[serde(default)]
    pub matchers: Vec<MatcherWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PartitionWire {
    pub treatment: String,
    pub size: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatcherType {
    AllKeys,
    InSegment,
    InLargeSegment,
    InRuleBasedSegment,
    Whitelist,
    EqualTo,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    Between,
    EqualToSet,
    PartOfSet,
    ContainsAllOfSet,
    ContainsAnyOfSet,
    StartsWith,
    EndsWith,
    ContainsString,
    MatchesString,
    InSplitTreatment,
    EqualToBoolean,
    EqualToSemver,
    GreaterThanOrEqualToSemver,
    LessThanOrEqualToSemver,
    BetweenSemver,
    InListSemver,
    /// Matcher type this version doesn't know about.
    #[serde(other)]
    Unsupported,
}

/// A single matcher. Exactly one of the `*_matcher_data` fields is expected to be set, depending
/// on `matcher_type`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MatcherWire {
    #[serde(default)]
    pub key_selector: Option<KeySelectorWire>,
    pub matcher_type: MatcherType,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherDataWire>,
    #[serde(default)]
    pub user_defined_large_segment_matcher_data: Option<LargeSegmentMatcherDataWire>,
    #[serde(default)]
    pub whitelist_matcher_data: Option<WhitelistMatcherDataWire>,
    #[serde(default)]
    pub unary_numeric_matcher_data: Option<UnaryNumericMatcherDataWire>,
    #[serde(default)]
    pub between_matcher_data: Option<BetweenMatcherDataWire>,
    #[serde(default)]
    pub dependency_matcher_data: Option<DependencyMatcherDataWire>,
    #[serde(default)]
    pub boolean_matcher_data: Option<bool>,
    #[serde(default)]
    pub string_matcher_data: Option<String>,
    #[serde(default)]
    pub between_string_matcher_data: Option<BetweenStringMatcherDataWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct KeySelectorWire {
    #[serde(default)]
    pub traffic_type: Option<String>,
    /// `None` means the evaluation key itself is matched.
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherDataWire {
    pub segment_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LargeSegmentMatcherDataWire {
    pub large_segment_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistMatcherDataWire {
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    Number,
    Datetime,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnaryNumericMatcherDataWire {
    #[serde(default)]
    pub data_type: Option<DataType>,
    pub value: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BetweenMatcherDataWire {
    #[serde(default)]
    pub data_type: Option<DataType>,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMatcherDataWire {
    pub split: String,
    #[serde(default)]
    pub treatments: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BetweenStringMatcherDataWire {
    pub start: String,
    pub end: String,
}

/// Rule-based segment definition.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RuleBasedSegmentWire {
    pub name: Option<String>,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default)]
    pub change_number: i64,
    pub status: Status,
    #[serde(default)]
    pub excluded: ExcludedWire,
    #[serde(default)]
    pub conditions: Vec<ConditionWire>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedWire {
    #[serde(default)]
    pub keys: HashSet<String>,
    #[serde(default)]
    pub segments: Vec<ExcludedSegmentWire>,
}

/// Excluded segment reference. Older payloads list bare names, which refer to standard segments.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExcludedSegmentWire {
    Typed {
        name: String,
        #[serde(rename = "type")]
        kind: SegmentKind,
    },
    Name(String),
}

/// Namespace of a segment referenced by name.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentKind {
    Standard,
    Large,
    RuleBased,
}
