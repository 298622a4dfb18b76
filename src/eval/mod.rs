//! Flag evaluation.
//!
//! Evaluation is a pure function of the key, its attributes and the current
//! [`RuleSetSnapshot`](crate::RuleSetSnapshot). It never performs I/O and never fails: anything
//! that goes wrong is reported as the `control` treatment with an explanatory label.
mod conditions;
mod context;
mod evaluator;
pub mod labels;

use serde::{Deserialize, Serialize};

use crate::rules::{FlagDefinition, CONTROL};

pub use evaluator::Evaluator;

/// Outcome of evaluating a flag for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub treatment: String,
    /// Why this treatment was returned. See [`labels`].
    pub label: String,
    /// Change number of the flag definition that produced the result. `None` if no definition was
    /// involved.
    pub change_number: Option<i64>,
    /// JSON-encoded configuration attached to the treatment.
    pub configuration: Option<String>,
}

impl EvaluationResult {
    pub(crate) fn control(label: &str, change_number: Option<i64>) -> EvaluationResult {
        EvaluationResult {
            treatment: CONTROL.to_owned(),
            label: label.to_owned(),
            change_number,
            configuration: None,
        }
    }

    pub(crate) fn default_treatment(flag: &FlagDefinition, label: &str) -> EvaluationResult {
        EvaluationResult {
            treatment: flag.default_treatment.clone(),
            label: label.to_owned(),
            change_number: Some(flag.change_number),
            configuration: flag.configuration_for(&flag.default_treatment),
        }
    }
}
