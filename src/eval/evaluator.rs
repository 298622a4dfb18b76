use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    attributes::Attributes,
    config::SyncConfig,
    eval::{context::EvalContext, labels, EvaluationResult},
    fallback::FallbackTreatments,
    rules::Key,
    snapshot::RuleSetSnapshot,
    storage::{RuleSetStorage, SegmentMembership},
};

/// Evaluates flags against the rule set currently held by storage.
///
/// `Evaluator` is cheap to share between threads. Every call reads the current snapshot once, so
/// a concurrent update is either fully visible to an evaluation or not at all.
pub struct Evaluator {
    storage: Arc<dyn RuleSetStorage>,
    segments: Arc<dyn SegmentMembership>,
    fallback_treatments: FallbackTreatments,
    prerequisite_depth_limit: usize,
}

impl Evaluator {
    pub fn new(storage: Arc<dyn RuleSetStorage>, segments: Arc<dyn SegmentMembership>) -> Evaluator {
        Evaluator {
            storage,
            segments,
            fallback_treatments: FallbackTreatments::default(),
            prerequisite_depth_limit: SyncConfig::DEFAULT_PREREQUISITE_DEPTH_LIMIT,
        }
    }

    /// Create an evaluator using the fallback treatments and depth limit from `config`.
    pub fn from_config(
        config: &SyncConfig,
        storage: Arc<dyn RuleSetStorage>,
        segments: Arc<dyn SegmentMembership>,
    ) -> Evaluator {
        Evaluator {
            storage,
            segments,
            fallback_treatments: config.fallback_treatments.clone(),
            prerequisite_depth_limit: config.prerequisite_depth_limit,
        }
    }

    /// Evaluate `flag_name` for `key`.
    ///
    /// This never fails. Any problem is reported as `control` (or the configured fallback
    /// treatment) with a label describing what went wrong.
    ///
    /// ```
    /// # use std::{collections::HashMap, sync::Arc};
    /// # use split_core::{Evaluator, InMemorySegments, InMemoryStorage, Key};
    /// let evaluator = Evaluator::new(
    ///     Arc::new(InMemoryStorage::new()),
    ///     Arc::new(InMemorySegments::new()),
    /// );
    /// let result = evaluator.evaluate(&Key::new("user-1"), "new_checkout", &HashMap::new());
    /// assert_eq!(result.treatment, "control");
    /// assert_eq!(result.label, "definition not found");
    /// ```
    pub fn evaluate(&self, key: &Key, flag_name: &str, attributes: &Attributes) -> EvaluationResult {
        let snapshot = self.storage.snapshot();
        self.evaluate_in(&snapshot, key, flag_name, attributes)
    }

    /// Evaluate several flags against the same snapshot.
    pub fn evaluate_many(
        &self,
        key: &Key,
        flag_names: &[&str],
        attributes: &Attributes,
    ) -> HashMap<String, EvaluationResult> {
        let snapshot = self.storage.snapshot();
        flag_names
            .iter()
            .map(|flag_name| {
                (
                    (*flag_name).to_owned(),
                    self.evaluate_in(&snapshot, key, flag_name, attributes),
                )
            })
            .collect()
    }

    /// Evaluate every flag belonging to any of `sets`.
    pub fn evaluate_by_sets(
        &self,
        key: &Key,
        sets: &[&str],
        attributes: &Attributes,
    ) -> HashMap<String, EvaluationResult> {
        let snapshot = self.storage.snapshot();
        snapshot
            .flag_names_by_sets(sets)
            .into_iter()
            .map(|flag_name| {
                let result = self.evaluate_in(&snapshot, key, &flag_name, attributes);
                (flag_name, result)
            })
            .collect()
    }

    fn evaluate_in(
        &self,
        snapshot: &RuleSetSnapshot,
        key: &Key,
        flag_name: &str,
        attributes: &Attributes,
    ) -> EvaluationResult {
        let ctx = EvalContext::new(snapshot, self.segments.as_ref(), self.prerequisite_depth_limit);

        let result = catch_unwind(AssertUnwindSafe(|| {
            ctx.evaluate_flag(key, flag_name, attributes)
        }))
        .unwrap_or_else(|_| {
            log::error!(target: "split",
                        flag_name,
                        matching_key = key.matching_key;
                        "unexpected failure while evaluating flag");
            EvaluationResult::control(
                labels::EXCEPTION,
                snapshot.get(flag_name).map(|flag| flag.change_number),
            )
        });

        let result = self.fallback_treatments.apply(flag_name, result);

        log::trace!(target: "split",
                    flag_name,
                    matching_key = key.matching_key,
                    treatment:display = result.treatment,
                    label:display = result.label;
                    "evaluated flag");

        result
    }
}
