use crate::diff::{DiffResult, WorldPopulationDelta};
use crate::worlds::WorldNames;

pub const MAX_REASSIGNMENTS_SHOWN: usize = 5;
pub const MAX_MEMBERSHIP_SHOWN: usize = 3;
pub const MAX_POPULATION_SHOWN: usize = 5;
pub const NO_CHANGES_MESSAGE: &str = "No world assignment changes detected.";

/// Human-readable summary of a diff: totals, ranked and truncated lists.
pub fn render_change_summary(diff: &DiffResult, names: &WorldNames) -> String {
    if !diff.has_changes() {
        return NO_CHANGES_MESSAGE.to_string();
    }

    let mut lines = vec![
        format!(
            "Previous: {} guilds across {} worlds",
            diff.total_previous, diff.worlds_previous
        ),
        format!(
            "Current: {} guilds across {} worlds",
            diff.total_current, diff.worlds_current
        ),
        String::new(),
    ];

    if !diff.reassigned.is_empty() {
        lines.push(format!(
            "{} guild(s) reassigned to new worlds:",
            diff.total_reassignments
        ));
        for (index, (guild_id, moved)) in diff
            .reassigned
            .iter()
            .take(MAX_REASSIGNMENTS_SHOWN)
            .enumerate()
        {
            lines.push(format!(
                "  {}. {guild_id}: {} -> {}",
                index + 1,
                names.label(&moved.old_world),
                names.label(&moved.new_world)
            ));
        }
        push_overflow(&mut lines, diff.reassigned.len(), MAX_REASSIGNMENTS_SHOWN);
        lines.push(String::new());
    }

    if !diff.added.is_empty() {
        lines.push(format!("{} new guild(s) added:", diff.added.len()));
        for (index, guild) in sorted_by_guild(&diff.added, |item| &item.guild_id)
            .into_iter()
            .take(MAX_MEMBERSHIP_SHOWN)
            .enumerate()
        {
            lines.push(format!(
                "  {}. {}: assigned to world {}",
                index + 1,
                guild.guild_id,
                names.label(&guild.new_world)
            ));
        }
        push_overflow(&mut lines, diff.added.len(), MAX_MEMBERSHIP_SHOWN);
        lines.push(String::new());
    }

    if !diff.removed.is_empty() {
        lines.push(format!("{} guild(s) removed:", diff.removed.len()));
        for (index, guild) in sorted_by_guild(&diff.removed, |item| &item.guild_id)
            .into_iter()
            .take(MAX_MEMBERSHIP_SHOWN)
            .enumerate()
        {
            lines.push(format!(
                "  {}. {}: removed from world {}",
                index + 1,
                guild.guild_id,
                names.label(&guild.old_world)
            ));
        }
        push_overflow(&mut lines, diff.removed.len(), MAX_MEMBERSHIP_SHOWN);
        lines.push(String::new());
    }

    if !diff.worlds_gained.is_empty() || !diff.worlds_lost.is_empty() {
        lines.push("World changes:".to_string());
        if !diff.worlds_gained.is_empty() {
            let gained = diff
                .worlds_gained
                .iter()
                .map(|world| names.label(world))
                .collect::<Vec<_>>();
            lines.push(format!("  Gained guilds in worlds: {}", gained.join(", ")));
        }
        if !diff.worlds_lost.is_empty() {
            let lost = diff
                .worlds_lost
                .iter()
                .map(|world| names.label(world))
                .collect::<Vec<_>>();
            lines.push(format!("  Lost guilds from worlds: {}", lost.join(", ")));
        }
    }

    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines.join("\n")
}

/// Top population swings as `World W: prev -> curr (+n)` lines.
pub fn render_population_impact(population: &[WorldPopulationDelta], names: &WorldNames) -> String {
    if population.is_empty() {
        return String::new();
    }
    let mut lines = vec!["World population impact:".to_string()];
    for delta in population.iter().take(MAX_POPULATION_SHOWN) {
        lines.push(format!(
            "  World {}: {} -> {} ({})",
            names.label(&delta.world_id),
            delta.previous_count,
            delta.current_count,
            signed_change(delta.net_change)
        ));
    }
    push_overflow(&mut lines, population.len(), MAX_POPULATION_SHOWN);
    lines.join("\n")
}

/// Summary and population impact joined by a blank line.
pub fn render_full_report(
    diff: &DiffResult,
    population: &[WorldPopulationDelta],
    names: &WorldNames,
) -> String {
    let summary = render_change_summary(diff, names);
    let impact = render_population_impact(population, names);
    if impact.is_empty() {
        summary
    } else {
        format!("{summary}\n\n{impact}")
    }
}

pub fn signed_change(value: i64) -> String {
    if value > 0 {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

fn push_overflow(lines: &mut Vec<String>, total: usize, shown: usize) {
    if total > shown {
        lines.push(format!("  ... and {} more", total - shown));
    }
}

fn sorted_by_guild<'a, T>(items: &'a [T], key: impl Fn(&T) -> &String) -> Vec<&'a T> {
    let mut sorted = items.iter().collect::<Vec<_>>();
    sorted.sort_by(|left, right| key(left).cmp(key(right)));
    sorted
}

#[cfg(test)]
mod tests {
    use super::{
        NO_CHANGES_MESSAGE, render_change_summary, render_full_report, render_population_impact,
        signed_change,
    };
    use crate::diff::{diff_mappings, population_deltas};
    use crate::mapping::{WorldAssignmentMap, WorldId};
    use crate::worlds::WorldNames;

    #[test]
    fn empty_diff_renders_fixed_message() {
        let mapping = WorldAssignmentMap::from_entries([("G1", 1)]);
        let diff = diff_mappings(&mapping, &mapping);
        assert_eq!(
            render_change_summary(&diff, &WorldNames::default()),
            NO_CHANGES_MESSAGE
        );
    }

    #[test]
    fn summary_lists_changes_with_names() {
        let previous = WorldAssignmentMap::from_entries([("G1", 11001), ("G2", 11002)]);
        let current = WorldAssignmentMap::from_entries([("G1", 11003), ("G2", 11002), ("G3", 7)]);
        let diff = diff_mappings(&previous, &current);
        let summary = render_change_summary(&diff, &WorldNames::with_defaults());

        assert!(summary.starts_with("Previous: 2 guilds across 2 worlds\nCurrent: 3 guilds across 3 worlds"));
        assert!(summary.contains("1 guild(s) reassigned to new worlds:"));
        assert!(summary.contains("  1. G1: Moogooloo (11001) -> Domain of Torment (11003)"));
        assert!(summary.contains("1 new guild(s) added:"));
        assert!(summary.contains("  1. G3: assigned to world 7"));
        assert!(summary.contains("  Gained guilds in worlds: Domain of Torment (11003)"));
        assert!(summary.contains("  Lost guilds from worlds: Moogooloo (11001)"));
        assert!(!summary.contains("removed"));
        assert!(!summary.ends_with('\n'));
    }

    #[test]
    fn long_lists_are_truncated() {
        let previous = WorldAssignmentMap::from_entries(
            (0..8).map(|index| (format!("G{index}"), WorldId::Number(1))),
        );
        let current = WorldAssignmentMap::from_entries(
            (0..8)
                .map(|index| (format!("G{index}"), WorldId::Number(2)))
                .chain((0..5).map(|index| (format!("N{index}"), WorldId::Number(3)))),
        );
        let diff = diff_mappings(&previous, &current);
        let summary = render_change_summary(&diff, &WorldNames::default());

        assert!(summary.contains("  5. G4: 1 -> 2"));
        assert!(!summary.contains("G5: 1 -> 2"));
        assert!(summary.contains("  ... and 3 more"));
        assert!(summary.contains("  3. N2: assigned to world 3"));
        assert!(summary.contains("  ... and 2 more"));
    }

    #[test]
    fn lost_worlds_render_without_gains() {
        let previous = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2)]);
        let current = WorldAssignmentMap::from_entries([("G2", 2)]);
        let diff = diff_mappings(&previous, &current);
        let summary = render_change_summary(&diff, &WorldNames::default());
        assert!(summary.contains("  1. G1: removed from world 1"));
        assert!(summary.contains("  Lost guilds from worlds: 1"));
        assert!(!summary.contains("Gained"));
    }

    #[test]
    fn population_impact_shows_signed_changes() {
        let previous = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 1)]);
        let current = WorldAssignmentMap::from_entries([("G1", 2), ("G2", 1)]);
        let diff = diff_mappings(&previous, &current);
        let population = population_deltas(&previous, &current, &diff);
        let impact = render_population_impact(&population, &WorldNames::default());
        assert_eq!(
            impact,
            "World population impact:\n  World 1: 2 -> 1 (-1)\n  World 2: 0 -> 1 (+1)"
        );

        let full = render_full_report(&diff, &population, &WorldNames::default());
        assert!(full.contains("\n\nWorld population impact:"));
    }

    #[test]
    fn signed_change_formats_sign() {
        assert_eq!(signed_change(3), "+3");
        assert_eq!(signed_change(-2), "-2");
        assert_eq!(signed_change(0), "0");
    }
}
