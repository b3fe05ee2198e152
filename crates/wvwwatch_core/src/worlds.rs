use std::collections::BTreeMap;

use crate::mapping::WorldId;

/// WvW team names for the North American alliance worlds.
pub const NA_WORLD_NAMES: &[(i64, &str)] = &[
    (11001, "Moogooloo"),
    (11002, "Rall's Rest"),
    (11003, "Domain of Torment"),
    (11004, "Yohlon Haven"),
    (11005, "Tombs of Drascir"),
    (11006, "Hall of Judgment"),
    (11007, "Throne of Balthazar"),
    (11008, "Dwayna's Temple"),
    (11009, "Abaddon's Prison"),
    (11010, "Cathedral of Blood"),
    (11011, "Lutgardis Conservatory"),
    (11012, "Mosswood"),
];

/// World id -> display name lookup used when rendering reports and rosters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldNames {
    names: BTreeMap<WorldId, String>,
}

impl WorldNames {
    pub fn with_defaults() -> Self {
        let mut names = Self::default();
        for (id, name) in NA_WORLD_NAMES {
            names.insert(WorldId::Number(*id), *name);
        }
        names
    }

    pub fn insert(&mut self, world: WorldId, name: impl Into<String>) {
        self.names.insert(world, name.into());
    }

    pub fn name(&self, world: &WorldId) -> Option<&str> {
        self.names.get(world).map(String::as_str)
    }

    /// `Name (id)` when the world is known, the bare id otherwise.
    pub fn label(&self, world: &WorldId) -> String {
        match self.name(world) {
            Some(name) => format!("{name} ({world})"),
            None => world.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::WorldNames;
    use crate::mapping::WorldId;

    #[test]
    fn defaults_cover_na_worlds() {
        let names = WorldNames::with_defaults();
        assert_eq!(names.len(), 12);
        assert_eq!(names.name(&WorldId::Number(11001)), Some("Moogooloo"));
    }

    #[test]
    fn label_falls_back_to_raw_id() {
        let mut names = WorldNames::default();
        names.insert(WorldId::Number(1), "Alpha");
        assert_eq!(names.label(&WorldId::Number(1)), "Alpha (1)");
        assert_eq!(names.label(&WorldId::Number(2)), "2");
    }
}
