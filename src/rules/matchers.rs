use std::{cmp::Ordering, collections::HashSet};

use regex::Regex;
use semver::Version;

use crate::{
    attributes::{AttributeValue, Attributes},
    rules::models::{DataType, SegmentKind},
};

/// Keys an evaluation is performed for.
#[derive(Debug, Clone, Copy)]
pub struct Key<'a> {
    /// Key matched by whitelists and segments.
    pub matching_key: &'a str,
    /// Key used for bucketing. Defaults to the matching key.
    pub bucketing_key: Option<&'a str>,
}

impl<'a> Key<'a> {
    /// Create a key whose bucketing key is the matching key.
    pub fn new(matching_key: &'a str) -> Key<'a> {
        Key {
            matching_key,
            bucketing_key: None,
        }
    }

    /// Create a key with a separate bucketing key.
    pub fn with_bucketing_key(matching_key: &'a str, bucketing_key: &'a str) -> Key<'a> {
        Key {
            matching_key,
            bucketing_key: Some(bucketing_key),
        }
    }

    pub(crate) fn bucketing_key(&self) -> &'a str {
        self.bucketing_key.unwrap_or(self.matching_key)
    }
}

/// Lookups a matcher needs beyond the value it matches against.
///
/// Implemented by the evaluator, which answers them from the current snapshot and segment
/// membership without any I/O.
pub(crate) trait MatchContext {
    /// Whether `key` is a member of the named segment.
    fn is_member(&self, key: &Key, kind: SegmentKind, segment_name: &str, attributes: &Attributes)
        -> bool;

    /// Treatment `key` gets for another flag. `None` if the flag cannot be evaluated (including
    /// when the dependency chain is too deep).
    fn dependency_treatment(
        &self,
        key: &Key,
        flag_name: &str,
        attributes: &Attributes,
    ) -> Option<String>;
}

#[derive(Debug, Clone)]
pub(crate) struct Matcher {
    /// Attribute to match. `None` matches the evaluation key.
    pub attribute: Option<String>,
    pub negate: bool,
    pub kind: MatcherKind,
}

#[derive(Debug, Clone)]
pub(crate) enum MatcherKind {
    AllKeys,
    InSegment(String),
    InLargeSegment(String),
    InRuleBasedSegment(String),
    Whitelist(HashSet<String>),
    EqualTo(DataType, i64),
    GreaterThanOrEqualTo(DataType, i64),
    LessThanOrEqualTo(DataType, i64),
    Between(DataType, i64, i64),
    EqualToSet(HashSet<String>),
    PartOfSet(HashSet<String>),
    ContainsAllOfSet(HashSet<String>),
    ContainsAnyOfSet(HashSet<String>),
    StartsWith(Vec<String>),
    EndsWith(Vec<String>),
    ContainsString(Vec<String>),
    MatchesString(Regex),
    InSplitTreatment {
        flag_name: String,
        treatments: HashSet<String>,
    },
    EqualToBoolean(bool),
    /// Semver bounds that failed to parse are kept as `None` and never match.
    EqualToSemver(Option<Version>),
    GreaterThanOrEqualToSemver(Option<Version>),
    LessThanOrEqualToSemver(Option<Version>),
    BetweenSemver(Option<Version>, Option<Version>),
    InListSemver(Vec<Version>),
}

impl Matcher {
    /// Evaluate the matcher, applying negation.
    ///
    /// A matcher on a named attribute that is absent (or null) never matches, negated or not.
    pub fn matches(&self, key: &Key, attributes: &Attributes, ctx: &dyn MatchContext) -> bool {
        let key_value;
        let value = match &self.attribute {
            None => {
                key_value = AttributeValue::String(key.matching_key.to_owned());
                &key_value
            }
            Some(attribute) => match attributes.get(attribute) {
                None | Some(AttributeValue::Null) => return false,
                Some(value) => value,
            },
        };

        let result = self.kind.try_match(value, key, attributes, ctx).unwrap_or(false);
        result != self.negate
    }
}

impl MatcherKind {
    /// Try applying the matcher to `value`, returning `None` if the value has the wrong type for
    /// this matcher.
    fn try_match(
        &self,
        value: &AttributeValue,
        key: &Key,
        attributes: &Attributes,
        ctx: &dyn MatchContext,
    ) -> Option<bool> {
        match self {
            MatcherKind::AllKeys => Some(true),
            MatcherKind::InSegment(name) => {
                let member_key = Key {
                    matching_key: value.as_str()?,
                    bucketing_key: key.bucketing_key,
                };
                Some(ctx.is_member(&member_key, SegmentKind::Standard, name, attributes))
            }
            MatcherKind::InLargeSegment(name) => {
                let member_key = Key {
                    matching_key: value.as_str()?,
                    bucketing_key: key.bucketing_key,
                };
                Some(ctx.is_member(&member_key, SegmentKind::Large, name, attributes))
            }
            MatcherKind::InRuleBasedSegment(name) => {
                let member_key = Key {
                    matching_key: value.as_str()?,
                    bucketing_key: key.bucketing_key,
                };
                Some(ctx.is_member(&member_key, SegmentKind::RuleBased, name, attributes))
            }
            MatcherKind::Whitelist(whitelist) => Some(whitelist.contains(value.as_str()?)),
            MatcherKind::EqualTo(data_type, expected) => {
                let value = value.as_integer()?;
                Some(match data_type {
                    DataType::Number => value == *expected,
                    DataType::Datetime => truncate_to_day(value) == truncate_to_day(*expected),
                })
            }
            MatcherKind::GreaterThanOrEqualTo(data_type, bound) => {
                let value = value.as_integer()?;
                Some(normalize(*data_type, value) >= normalize(*data_type, *bound))
            }
            MatcherKind::LessThanOrEqualTo(data_type, bound) => {
                let value = value.as_integer()?;
                Some(normalize(*data_type, value) <= normalize(*data_type, *bound))
            }
            MatcherKind::Between(data_type, start, end) => {
                let value = normalize(*data_type, value.as_integer()?);
                Some(normalize(*data_type, *start) <= value && value <= normalize(*data_type, *end))
            }
            MatcherKind::EqualToSet(set) => {
                let values = as_set(value)?;
                Some(values == set.iter().map(String::as_str).collect::<HashSet<_>>())
            }
            MatcherKind::PartOfSet(set) => {
                let values = as_set(value)?;
                Some(!values.is_empty() && values.iter().all(|v| set.contains(*v)))
            }
            MatcherKind::ContainsAllOfSet(set) => {
                let values = as_set(value)?;
                Some(set.iter().all(|v| values.contains(v.as_str())))
            }
            MatcherKind::ContainsAnyOfSet(set) => {
                let values = as_set(value)?;
                Some(set.iter().any(|v| values.contains(v.as_str())))
            }
            MatcherKind::StartsWith(prefixes) => {
                let s = value.as_str()?;
                Some(prefixes.iter().any(|prefix| s.starts_with(prefix.as_str())))
            }
            MatcherKind::EndsWith(suffixes) => {
                let s = value.as_str()?;
                Some(suffixes.iter().any(|suffix| s.ends_with(suffix.as_str())))
            }
            MatcherKind::ContainsString(needles) => {
                let s = value.as_str()?;
                Some(needles.iter().any(|needle| s.contains(needle.as_str())))
            }
            MatcherKind::MatchesString(regex) => Some(regex.is_match(value.as_str()?)),
            MatcherKind::InSplitTreatment {
                flag_name,
                treatments,
            } => {
                let treatment = ctx.dependency_treatment(key, flag_name, attributes)?;
                Some(treatments.contains(&treatment))
            }
            MatcherKind::EqualToBoolean(expected) => {
                let value = match value {
                    AttributeValue::Boolean(b) => *b,
                    AttributeValue::String(s) if s.eq_ignore_ascii_case("true") => true,
                    AttributeValue::String(s) if s.eq_ignore_ascii_case("false") => false,
                    _ => return None,
                };
                Some(value == *expected)
            }
            MatcherKind::EqualToSemver(expected) => {
                let (expected, version) = (expected.as_ref()?, as_version(value)?);
                // Equality takes build metadata into account.
                Some(&version == expected)
            }
            MatcherKind::GreaterThanOrEqualToSemver(bound) => {
                let (bound, version) = (bound.as_ref()?, as_version(value)?);
                Some(precedence(&version, bound) != Ordering::Less)
            }
            MatcherKind::LessThanOrEqualToSemver(bound) => {
                let (bound, version) = (bound.as_ref()?, as_version(value)?);
                Some(precedence(&version, bound) != Ordering::Greater)
            }
            MatcherKind::BetweenSemver(start, end) => {
                let (start, end) = (start.as_ref()?, end.as_ref()?);
                let version = as_version(value)?;
                Some(
                    precedence(&version, start) != Ordering::Less
                        && precedence(&version, end) != Ordering::Greater,
                )
            }
            MatcherKind::InListSemver(versions) => {
                let version = as_version(value)?;
                Some(versions.contains(&version))
            }
        }
    }
}

const MILLIS_PER_MINUTE: i64 = 60 * 1000;
const MILLIS_PER_DAY: i64 = 24 * 60 * MILLIS_PER_MINUTE;

fn truncate_to_day(millis: i64) -> i64 {
    millis - millis.rem_euclid(MILLIS_PER_DAY)
}

fn truncate_to_minute(millis: i64) -> i64 {
    millis - millis.rem_euclid(MILLIS_PER_MINUTE)
}

/// Datetime ordering ignores seconds and milliseconds.
fn normalize(data_type: DataType, value: i64) -> i64 {
    match data_type {
        DataType::Number => value,
        DataType::Datetime => truncate_to_minute(value),
    }
}

fn as_set(value: &AttributeValue) -> Option<HashSet<&str>> {
    Some(value.as_list()?.iter().map(String::as_str).collect())
}

fn as_version(value: &AttributeValue) -> Option<Version> {
    Version::parse(value.as_str()?.trim()).ok()
}

/// Semver precedence. Unlike `Ord` for [`Version`], build metadata is ignored.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}
