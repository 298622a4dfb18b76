use crate::{
    attributes::Attributes,
    hasher::{bucket, Algo},
    rules::{models::ConditionType, Condition, FlagDefinition, Key, MatchContext, Partition},
};

/// Result of walking a flag's conditions.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConditionOutcome<'a> {
    Matched { treatment: &'a str, label: &'a str },
    /// The key fell outside the traffic allocation before any rollout condition matched.
    NotInSplit,
    NoMatch,
}

/// Walk `flag.conditions` in order and return the first match.
///
/// The traffic allocation gate is checked once, when the first rollout condition is reached.
pub(crate) fn evaluate_conditions<'a>(
    flag: &'a FlagDefinition,
    key: &Key,
    attributes: &Attributes,
    ctx: &dyn MatchContext,
) -> ConditionOutcome<'a> {
    let bucketing_key = key.bucketing_key();
    let mut in_rollout = false;

    for condition in &flag.conditions {
        if !in_rollout && condition.condition_type == ConditionType::Rollout {
            if flag.traffic_allocation < 100 {
                let allocation_bucket =
                    bucket(bucketing_key, flag.traffic_allocation_seed, flag.algo);
                if allocation_bucket >= flag.traffic_allocation.max(0) as u32 {
                    return ConditionOutcome::NotInSplit;
                }
            }
            in_rollout = true;
        }

        if !matcher_group_matches(condition, key, attributes, ctx) {
            continue;
        }
        // A bucket not covered by any partition falls through to the next condition.
        if let Some(treatment) =
            select_treatment(&condition.partitions, bucketing_key, flag.seed, flag.algo)
        {
            return ConditionOutcome::Matched {
                treatment,
                label: &condition.label,
            };
        }
    }

    ConditionOutcome::NoMatch
}

/// Matchers of a condition are combined with AND.
pub(crate) fn matcher_group_matches(
    condition: &Condition,
    key: &Key,
    attributes: &Attributes,
    ctx: &dyn MatchContext,
) -> bool {
    condition
        .matchers
        .iter()
        .all(|matcher| matcher.matches(key, attributes, ctx))
}

/// Pick the partition `bucketing_key` falls into. Returns `None` for buckets past the last
/// partition, which only happens when partition sizes don't add up to 100.
fn select_treatment<'a>(
    partitions: &'a [Partition],
    bucketing_key: &str,
    seed: i32,
    algo: Algo,
) -> Option<&'a str> {
    if let [only] = partitions {
        if only.size >= 100 {
            return Some(&only.treatment);
        }
    }

    let bucket = bucket(bucketing_key, seed, algo);
    let mut covered = 0u32;
    for partition in partitions {
        covered += partition.size.max(0) as u32;
        if bucket < covered {
            return Some(&partition.treatment);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use crate::{
        attributes::Attributes,
        hasher::{bucket, Algo},
        rules::{
            matchers::{Matcher, MatcherKind},
            models::{ConditionType, SegmentKind},
            Condition, FlagDefinition, Key, MatchContext, Partition,
        },
    };

    use super::{evaluate_conditions, select_treatment, ConditionOutcome};

    struct NoContext;

    impl MatchContext for NoContext {
        fn is_member(&self, _: &Key, _: SegmentKind, _: &str, _: &Attributes) -> bool {
            false
        }

        fn dependency_treatment(&self, _: &Key, _: &str, _: &Attributes) -> Option<String> {
            None
        }
    }

    fn partitions(sizes: &[(&str, i32)]) -> Vec<Partition> {
        sizes
            .iter()
            .map(|(treatment, size)| Partition {
                treatment: treatment.to_string(),
                size: *size,
            })
            .collect()
    }

    fn condition(condition_type: ConditionType, label: &str, kind: MatcherKind, treatment: &str) -> Condition {
        Condition {
            condition_type,
            label: label.to_owned(),
            partitions: partitions(&[(treatment, 100)]),
            matchers: vec![Matcher {
                attribute: None,
                negate: false,
                kind,
            }],
        }
    }

    fn flag(traffic_allocation: i32, conditions: Vec<Condition>) -> FlagDefinition {
        FlagDefinition {
            name: "flag".to_owned(),
            traffic_type_name: None,
            seed: 1,
            traffic_allocation,
            traffic_allocation_seed: 7,
            killed: false,
            default_treatment: "off".to_owned(),
            change_number: 1,
            algo: Algo::Murmur3,
            sets: HashSet::new(),
            configurations: HashMap::new(),
            conditions,
            prerequisites: Vec::new(),
        }
    }

    #[test]
    fn first_matching_condition_wins() {
        let flag = flag(
            100,
            vec![
                condition(
                    ConditionType::Whitelist,
                    "whitelisted",
                    MatcherKind::Whitelist(HashSet::from(["nico_test".to_owned()])),
                    "on",
                ),
                condition(ConditionType::Rollout, "in rollout", MatcherKind::AllKeys, "off"),
            ],
        );

        assert_eq!(
            evaluate_conditions(&flag, &Key::new("nico_test"), &HashMap::new(), &NoContext),
            ConditionOutcome::Matched {
                treatment: "on",
                label: "whitelisted"
            }
        );
        assert_eq!(
            evaluate_conditions(&flag, &Key::new("bla"), &HashMap::new(), &NoContext),
            ConditionOutcome::Matched {
                treatment: "off",
                label: "in rollout"
            }
        );
    }

    #[test]
    fn zero_allocation_gates_rollout_but_not_whitelists() {
        let flag = flag(
            0,
            vec![
                condition(
                    ConditionType::Whitelist,
                    "whitelisted",
                    MatcherKind::Whitelist(HashSet::from(["nico_test".to_owned()])),
                    "on",
                ),
                condition(ConditionType::Rollout, "in rollout", MatcherKind::AllKeys, "on"),
            ],
        );

        assert_eq!(
            evaluate_conditions(&flag, &Key::new("nico_test"), &HashMap::new(), &NoContext),
            ConditionOutcome::Matched {
                treatment: "on",
                label: "whitelisted"
            }
        );
        assert_eq!(
            evaluate_conditions(&flag, &Key::new("bla"), &HashMap::new(), &NoContext),
            ConditionOutcome::NotInSplit
        );
    }

    #[test]
    fn allocation_gate_uses_allocation_seed() {
        // user_1 lands in bucket 82 with seed 1 and algo murmur3.
        let mut flag = flag(
            50,
            vec![condition(ConditionType::Rollout, "in rollout", MatcherKind::AllKeys, "on")],
        );
        flag.traffic_allocation_seed = 1;
        assert_eq!(bucket("user_1", 1, Algo::Murmur3), 82);
        assert_eq!(
            evaluate_conditions(&flag, &Key::new("user_1"), &HashMap::new(), &NoContext),
            ConditionOutcome::NotInSplit
        );

        flag.traffic_allocation = 83;
        assert!(matches!(
            evaluate_conditions(&flag, &Key::new("user_1"), &HashMap::new(), &NoContext),
            ConditionOutcome::Matched { treatment: "on", .. }
        ));
    }

    #[test]
    fn no_match_falls_through() {
        let flag = flag(
            100,
            vec![condition(
                ConditionType::Whitelist,
                "whitelisted",
                MatcherKind::Whitelist(HashSet::from(["someone".to_owned()])),
                "on",
            )],
        );
        assert_eq!(
            evaluate_conditions(&flag, &Key::new("bla"), &HashMap::new(), &NoContext),
            ConditionOutcome::NoMatch
        );
    }

    #[test]
    fn partition_walk_uses_bucketing_key() {
        let partitions = partitions(&[("on", 50), ("off", 50)]);
        // user_1 with seed 1: murmur3 bucket 82.
        assert_eq!(select_treatment(&partitions, "user_1", 1, Algo::Murmur3), Some("off"));
        // abc with seed 123456: murmur3 bucket 10.
        assert_eq!(select_treatment(&partitions, "abc", 123456, Algo::Murmur3), Some("on"));
    }

    #[test]
    fn oversized_partitions_stop_at_the_first_covering_one() {
        // The walk stops once the running total passes the bucket, so it stays below 100 plus
        // one partition size.
        let huge = partitions(&[("x", 0), ("a", i32::MAX), ("b", i32::MAX), ("c", i32::MAX)]);
        assert_eq!(select_treatment(&huge, "user_1", 1, Algo::Murmur3), Some("a"));
    }

    #[test]
    fn uncovered_buckets_fall_through() {
        assert_eq!(select_treatment(&partitions(&[("on", 10)]), "user_1", 1, Algo::Murmur3), None);
        assert_eq!(select_treatment(&[], "user_1", 1, Algo::Murmur3), None);

        let mut short = condition(ConditionType::Rollout, "short", MatcherKind::AllKeys, "on");
        short.partitions = partitions(&[("on", 10)]);
        let flag = flag(
            100,
            vec![short, condition(ConditionType::Rollout, "in rollout", MatcherKind::AllKeys, "off")],
        );
        // user_1 lands in bucket 82 with seed 1.
        assert_eq!(
            evaluate_conditions(&flag, &Key::new("user_1"), &HashMap::new(), &NoContext),
            ConditionOutcome::Matched {
                treatment: "off",
                label: "in rollout"
            }
        );
    }
}
