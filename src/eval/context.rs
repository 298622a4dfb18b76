use crate::{
    attributes::Attributes,
    error::EvaluationFailure,
    eval::{
        conditions::{evaluate_conditions, matcher_group_matches, ConditionOutcome},
        labels, EvaluationResult,
    },
    rules::{models::SegmentKind, FlagDefinition, Key, MatchContext},
    snapshot::RuleSetSnapshot,
    storage::SegmentMembership,
};

/// Everything a single evaluation reads. Nested flags and rule-based segments are evaluated with
/// a child context one level deeper.
#[derive(Clone, Copy)]
pub(crate) struct EvalContext<'a> {
    snapshot: &'a RuleSetSnapshot,
    segments: &'a dyn SegmentMembership,
    depth: usize,
    depth_limit: usize,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        snapshot: &'a RuleSetSnapshot,
        segments: &'a dyn SegmentMembership,
        depth_limit: usize,
    ) -> EvalContext<'a> {
        EvalContext {
            snapshot,
            segments,
            depth: 0,
            depth_limit,
        }
    }

    /// Context for a nested evaluation, or `None` if the depth limit is reached.
    fn nested(&self) -> Option<EvalContext<'a>> {
        if self.depth >= self.depth_limit {
            log::warn!(target: "split",
                       depth_limit = self.depth_limit;
                       "flag dependency chain is too deep, treating as not met");
            return None;
        }
        Some(EvalContext {
            depth: self.depth + 1,
            ..*self
        })
    }

    pub fn evaluate_flag(&self, key: &Key, flag_name: &str, attributes: &Attributes) -> EvaluationResult {
        match self.snapshot.flag_entry(flag_name) {
            None => EvaluationResult::control(labels::DEFINITION_NOT_FOUND, None),
            Some(Err(EvaluationFailure::MalformedDefinition { change_number, .. })) => {
                EvaluationResult::control(labels::EXCEPTION, *change_number)
            }
            Some(Ok(flag)) => self.evaluate_definition(key, flag, attributes),
        }
    }

    fn evaluate_definition(
        &self,
        key: &Key,
        flag: &FlagDefinition,
        attributes: &Attributes,
    ) -> EvaluationResult {
        if flag.killed {
            return EvaluationResult::default_treatment(flag, labels::KILLED);
        }

        if !self.prerequisites_met(key, flag, attributes) {
            return EvaluationResult::default_treatment(flag, labels::PREREQUISITES_NOT_MET);
        }

        match evaluate_conditions(flag, key, attributes, self) {
            ConditionOutcome::Matched { treatment, label } => EvaluationResult {
                treatment: treatment.to_owned(),
                label: label.to_owned(),
                change_number: Some(flag.change_number),
                configuration: flag.configuration_for(treatment),
            },
            ConditionOutcome::NotInSplit => {
                EvaluationResult::default_treatment(flag, labels::NOT_IN_SPLIT)
            }
            ConditionOutcome::NoMatch => {
                EvaluationResult::default_treatment(flag, labels::DEFAULT_RULE)
            }
        }
    }

    /// Prerequisites are checked in declared order. A missing prerequisite flag is never met.
    fn prerequisites_met(&self, key: &Key, flag: &FlagDefinition, attributes: &Attributes) -> bool {
        flag.prerequisites.iter().all(|prerequisite| {
            self.dependency_treatment(key, &prerequisite.flag_name, attributes)
                .is_some_and(|treatment| prerequisite.treatments.contains(&treatment))
        })
    }

    fn in_rule_based_segment(&self, key: &Key, segment_name: &str, attributes: &Attributes) -> bool {
        let Some(nested) = self.nested() else {
            return false;
        };
        let segment = match self.snapshot.rule_based_segment_entry(segment_name) {
            Some(Ok(segment)) => segment,
            Some(Err(_)) | None => return false,
        };

        if segment.excluded_keys.contains(key.matching_key) {
            return false;
        }
        if segment
            .excluded_segments
            .iter()
            .any(|(kind, name)| nested.is_member(key, *kind, name, attributes))
        {
            return false;
        }

        segment
            .conditions
            .iter()
            .any(|condition| matcher_group_matches(condition, key, attributes, &nested))
    }
}

impl<'a> MatchContext for EvalContext<'a> {
    fn is_member(
        &self,
        key: &Key,
        kind: SegmentKind,
        segment_name: &str,
        attributes: &Attributes,
    ) -> bool {
        match kind {
            SegmentKind::Standard | SegmentKind::Large => {
                self.segments.is_member(key.matching_key, kind, segment_name)
            }
            SegmentKind::RuleBased => self.in_rule_based_segment(key, segment_name, attributes),
        }
    }

    fn dependency_treatment(
        &self,
        key: &Key,
        flag_name: &str,
        attributes: &Attributes,
    ) -> Option<String> {
        let nested = self.nested()?;
        // Checking for presence first so that a missing dependency doesn't look like `control`.
        self.snapshot.flag_entry(flag_name)?;
        Some(nested.evaluate_flag(key, flag_name, attributes).treatment)
    }
}
