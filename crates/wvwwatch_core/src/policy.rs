use crate::diff::DiffResult;

pub const DEFAULT_REASSIGN_THRESHOLD: usize = 1;

/// Whether a diff warrants downstream notification.
///
/// Only reassignments count toward the threshold. At the default of 1,
/// guild additions and removals alone are informational; a threshold of 0
/// fires on any run that reaches the diff.
pub fn should_trigger(diff: &DiffResult, threshold: usize) -> bool {
    diff.total_reassignments >= threshold
}

#[cfg(test)]
mod tests {
    use super::should_trigger;
    use crate::diff::diff_mappings;
    use crate::mapping::WorldAssignmentMap;

    #[test]
    fn fires_on_any_reassignment_at_low_thresholds() {
        let previous = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2)]);
        let current = WorldAssignmentMap::from_entries([("G1", 3), ("G2", 2)]);
        let diff = diff_mappings(&previous, &current);
        assert!(should_trigger(&diff, 0));
        assert!(should_trigger(&diff, 1));
        assert!(!should_trigger(&diff, 2));
    }

    #[test]
    fn additions_and_removals_fire_only_at_threshold_zero() {
        let previous = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2)]);
        let current = WorldAssignmentMap::from_entries([("G2", 2), ("G3", 4), ("G4", 4)]);
        let diff = diff_mappings(&previous, &current);
        assert_eq!(diff.total_changes, 3);
        assert_eq!(diff.total_reassignments, 0);
        assert!(should_trigger(&diff, 0));
        for threshold in 1..5 {
            assert!(!should_trigger(&diff, threshold));
        }
    }

    #[test]
    fn decision_is_monotonic_in_threshold() {
        let previous = WorldAssignmentMap::from_entries([("A", 1), ("B", 1), ("C", 1), ("D", 2)]);
        let current = WorldAssignmentMap::from_entries([("A", 2), ("B", 2), ("C", 3), ("D", 2)]);
        let diff = diff_mappings(&previous, &current);
        assert_eq!(diff.total_reassignments, 3);

        for threshold in 0..=10usize {
            let fired = should_trigger(&diff, threshold);
            assert_eq!(fired, threshold <= diff.total_reassignments);
            if fired {
                for lower in 0..threshold {
                    assert!(should_trigger(&diff, lower));
                }
            }
        }
    }
}
