//! Flag and rule-based segment definitions: wire format, matchers and the compiled evaluation
//! model.
mod compiled;
pub(crate) mod matchers;
pub mod models;

pub use compiled::{Condition, FlagDefinition, Partition, Prerequisite, RuleBasedSegment, CONTROL};
pub use matchers::Key;

pub(crate) use compiled::{
    compile_flag, compile_rule_based_segment, FlagEntry, RuleBasedSegmentEntry,
};
pub(crate) use matchers::MatchContext;
