//! Fallback treatments returned instead of `control`.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{eval::labels, eval::EvaluationResult, rules::CONTROL};

/// Treatment (and optional configuration) to return instead of `control`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTreatment {
    pub treatment: String,
    #[serde(default)]
    pub config: Option<String>,
}

impl FallbackTreatment {
    pub fn new(treatment: impl Into<String>) -> FallbackTreatment {
        FallbackTreatment {
            treatment: treatment.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> FallbackTreatment {
        self.config = Some(config.into());
        self
    }
}

/// Fallback treatments, globally and per flag. A per-flag fallback takes precedence over the
/// global one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackTreatments {
    #[serde(default)]
    pub global: Option<FallbackTreatment>,
    #[serde(default)]
    pub by_flag: HashMap<String, FallbackTreatment>,
}

impl FallbackTreatments {
    pub fn with_global(mut self, fallback: FallbackTreatment) -> FallbackTreatments {
        self.global = Some(fallback);
        self
    }

    pub fn with_flag(mut self, flag_name: impl Into<String>, fallback: FallbackTreatment) -> FallbackTreatments {
        self.by_flag.insert(flag_name.into(), fallback);
        self
    }

    /// Fallback that applies to `flag_name`, if any.
    pub fn resolve(&self, flag_name: &str) -> Option<&FallbackTreatment> {
        self.by_flag.get(flag_name).or(self.global.as_ref())
    }

    /// Replace a `control` result with the applicable fallback. Other results are returned
    /// unchanged.
    pub(crate) fn apply(&self, flag_name: &str, result: EvaluationResult) -> EvaluationResult {
        if result.treatment != CONTROL {
            return result;
        }
        let Some(fallback) = self.resolve(flag_name) else {
            return result;
        };
        EvaluationResult {
            treatment: fallback.treatment.clone(),
            label: format!("{}{}", labels::FALLBACK_PREFIX, result.label),
            change_number: result.change_number,
            configuration: fallback.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::eval::{labels, EvaluationResult};

    use super::{FallbackTreatment, FallbackTreatments};

    fn control() -> EvaluationResult {
        EvaluationResult::control(labels::DEFINITION_NOT_FOUND, None)
    }

    #[test]
    fn flag_fallback_wins_over_global() {
        let fallbacks = FallbackTreatments::default()
            .with_global(FallbackTreatment::new("off"))
            .with_flag("checkout", FallbackTreatment::new("on").with_config(r#"{"color":"red"}"#));

        let result = fallbacks.apply("checkout", control());
        assert_eq!(result.treatment, "on");
        assert_eq!(result.label, "fallback - definition not found");
        assert_eq!(result.configuration.as_deref(), Some(r#"{"color":"red"}"#));

        let result = fallbacks.apply("other", control());
        assert_eq!(result.treatment, "off");
        assert_eq!(result.configuration, None);
    }

    #[test]
    fn only_control_is_replaced() {
        let fallbacks = FallbackTreatments::default().with_global(FallbackTreatment::new("off"));
        let result = EvaluationResult {
            treatment: "on".to_owned(),
            label: labels::DEFAULT_RULE.to_owned(),
            change_number: Some(3),
            configuration: None,
        };
        assert_eq!(fallbacks.apply("flag", result.clone()), result);
    }

    #[test]
    fn no_fallback_keeps_control() {
        assert_eq!(FallbackTreatments::default().apply("flag", control()), control());
    }

    #[test]
    fn deserialize() {
        let fallbacks: FallbackTreatments = serde_json::from_str(
            r#"{"global": {"treatment": "off"}, "byFlag": {"a": {"treatment": "on", "config": "{}"}}}"#,
        )
        .unwrap();
        assert_eq!(fallbacks.resolve("a"), Some(&FallbackTreatment::new("on").with_config("{}")));
        assert_eq!(fallbacks.resolve("b"), Some(&FallbackTreatment::new("off")));
    }
}
