use crate::snapshot::ChangeNumbers;

/// Decides whether a fetch brought new data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeChecker;

impl ChangeChecker {
    pub fn change_number_is_newer(&self, stored: i64, updated: i64) -> bool {
        stored < updated
    }

    /// Either flags or rule-based segments moved forward.
    pub fn rule_set_changed(&self, stored: ChangeNumbers, updated: ChangeNumbers) -> bool {
        self.change_number_is_newer(stored.flags, updated.flags)
            || self.change_number_is_newer(stored.rule_based_segments, updated.rule_based_segments)
    }
}

#[cfg(test)]
mod tests {
    use crate::snapshot::ChangeNumbers;

    use super::ChangeChecker;

    #[test]
    fn newer_flags_or_segments_are_a_change() {
        let checker = ChangeChecker;
        let stored = ChangeNumbers::new(10, 5);
        assert!(checker.rule_set_changed(stored, ChangeNumbers::new(11, 5)));
        assert!(checker.rule_set_changed(stored, ChangeNumbers::new(10, 6)));
        assert!(!checker.rule_set_changed(stored, ChangeNumbers::new(10, 5)));
        assert!(!checker.rule_set_changed(stored, ChangeNumbers::new(9, 4)));
    }
}
