use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::mapping::{WorldAssignmentMap, WorldId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    pub old_world: WorldId,
    pub new_world: WorldId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedGuild {
    pub guild_id: String,
    pub new_world: WorldId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedGuild {
    pub guild_id: String,
    pub old_world: WorldId,
}

/// Classification of every guild across two snapshots.
///
/// A world can sit in both `worlds_lost` and `worlds_gained` when guilds moved
/// in and out of it; neither set says anything about net population.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub reassigned: BTreeMap<String, Reassignment>,
    pub added: Vec<AddedGuild>,
    pub removed: Vec<RemovedGuild>,
    pub worlds_gained: BTreeSet<WorldId>,
    pub worlds_lost: BTreeSet<WorldId>,
    pub total_previous: usize,
    pub total_current: usize,
    pub worlds_previous: usize,
    pub worlds_current: usize,
    pub total_unchanged: usize,
    pub total_reassignments: usize,
    pub total_changes: usize,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        self.total_changes > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldPopulationDelta {
    pub world_id: WorldId,
    pub previous_count: usize,
    pub current_count: usize,
    pub net_change: i64,
    pub guilds_moved_in: Vec<String>,
    pub guilds_moved_out: Vec<String>,
}

/// Compare two snapshots guild by guild. Inputs are left untouched.
pub fn diff_mappings(previous: &WorldAssignmentMap, current: &WorldAssignmentMap) -> DiffResult {
    let guild_ids = previous
        .guild_ids()
        .chain(current.guild_ids())
        .collect::<BTreeSet<_>>();

    let mut result = DiffResult {
        total_previous: previous.len(),
        total_current: current.len(),
        worlds_previous: previous.world_count(),
        worlds_current: current.world_count(),
        ..DiffResult::default()
    };

    for guild_id in guild_ids {
        match (previous.get(guild_id), current.get(guild_id)) {
            (None, Some(new_world)) => result.added.push(AddedGuild {
                guild_id: guild_id.to_string(),
                new_world: new_world.clone(),
            }),
            (Some(old_world), None) => {
                result.worlds_lost.insert(old_world.clone());
                result.removed.push(RemovedGuild {
                    guild_id: guild_id.to_string(),
                    old_world: old_world.clone(),
                });
            }
            (Some(old_world), Some(new_world)) if old_world != new_world => {
                result.worlds_lost.insert(old_world.clone());
                result.worlds_gained.insert(new_world.clone());
                result.reassigned.insert(
                    guild_id.to_string(),
                    Reassignment {
                        old_world: old_world.clone(),
                        new_world: new_world.clone(),
                    },
                );
            }
            (Some(_), Some(_)) => result.total_unchanged += 1,
            (None, None) => {}
        }
    }

    result.total_reassignments = result.reassigned.len();
    result.total_changes = result.added.len() + result.removed.len() + result.total_reassignments;
    result
}

/// Per-world population change, largest absolute swing first.
///
/// Counts come from full tallies of both snapshots, so additions and removals
/// move the numbers too; only reassignments are itemized in the moved lists.
/// Worlds whose population did not change are omitted.
pub fn population_deltas(
    previous: &WorldAssignmentMap,
    current: &WorldAssignmentMap,
    diff: &DiffResult,
) -> Vec<WorldPopulationDelta> {
    let previous_population = previous.world_populations();
    let current_population = current.world_populations();
    let worlds = previous_population
        .keys()
        .chain(current_population.keys())
        .copied()
        .collect::<BTreeSet<_>>();

    let mut deltas = BTreeMap::new();
    for world in worlds {
        let previous_count = previous_population.get(world).copied().unwrap_or(0);
        let current_count = current_population.get(world).copied().unwrap_or(0);
        let net_change = signed(current_count) - signed(previous_count);
        if net_change == 0 {
            continue;
        }
        deltas.insert(
            world.clone(),
            WorldPopulationDelta {
                world_id: world.clone(),
                previous_count,
                current_count,
                net_change,
                guilds_moved_in: Vec::new(),
                guilds_moved_out: Vec::new(),
            },
        );
    }

    for (guild_id, reassignment) in &diff.reassigned {
        if let Some(delta) = deltas.get_mut(&reassignment.old_world) {
            delta.guilds_moved_out.push(guild_id.clone());
        }
        if let Some(delta) = deltas.get_mut(&reassignment.new_world) {
            delta.guilds_moved_in.push(guild_id.clone());
        }
    }

    let mut ordered = deltas.into_values().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        right
            .net_change
            .unsigned_abs()
            .cmp(&left.net_change.unsigned_abs())
            .then_with(|| left.world_id.cmp(&right.world_id))
    });
    ordered
}

fn signed(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
