//! Labels attached to evaluation results.

/// The flag is killed.
pub const KILLED: &str = "killed";

/// No condition matched.
pub const DEFAULT_RULE: &str = "default rule";

/// The flag is not in the current snapshot.
pub const DEFINITION_NOT_FOUND: &str = "definition not found";

/// The key fell outside the flag's traffic allocation.
pub const NOT_IN_SPLIT: &str = "not in split";

/// The flag could not be evaluated.
pub const EXCEPTION: &str = "exception";

/// A prerequisite flag did not return one of the accepted treatments.
pub const PREREQUISITES_NOT_MET: &str = "prerequisites not met";

/// The flag uses a matcher this library doesn't know.
pub const UNSUPPORTED_MATCHER_TYPE: &str = "unsupported matcher type";

/// Prefix of labels of results replaced by a fallback treatment.
pub const FALLBACK_PREFIX: &str = "fallback - ";
