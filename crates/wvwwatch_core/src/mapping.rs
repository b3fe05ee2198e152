use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A WvW world (team) identifier. The live API reports integers; hand-maintained
/// sources sometimes carry names, so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorldId {
    Number(i64),
    Name(String),
}

impl WorldId {
    /// Parse a textual world id, preferring the numeric form when it fits.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.parse::<i64>() {
            Ok(number) => Self::Number(number),
            Err(_) => Self::Name(trimmed.to_string()),
        }
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for WorldId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for WorldId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<&str> for WorldId {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for WorldId {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

/// Point-in-time guild id -> world id assignment. Built once, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldAssignmentMap {
    entries: BTreeMap<String, WorldId>,
}

impl WorldAssignmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K, W>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, W)>,
        K: Into<String>,
        W: Into<WorldId>,
    {
        entries
            .into_iter()
            .map(|(guild, world)| (guild.into(), world.into()))
            .collect()
    }

    /// Decode the `/v2/wvw/guilds/<region>` payload: a JSON object of guild id -> world id.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            bail!("expected a JSON object of guild id -> world id");
        };
        let mut entries = BTreeMap::new();
        for (guild_id, world) in object {
            let world_id = match world {
                Value::Number(number) => match number.as_i64() {
                    Some(value) => WorldId::Number(value),
                    None => bail!("world id for guild {guild_id} is not an integer: {number}"),
                },
                Value::String(text) if !text.trim().is_empty() => WorldId::parse(text),
                other => bail!("unsupported world id for guild {guild_id}: {other}"),
            };
            entries.insert(guild_id.clone(), world_id);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, guild_id: &str) -> Option<&WorldId> {
        self.entries.get(guild_id)
    }

    pub fn contains_guild(&self, guild_id: &str) -> bool {
        self.entries.contains_key(guild_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending guild id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &WorldId)> {
        self.entries
            .iter()
            .map(|(guild, world)| (guild.as_str(), world))
    }

    pub fn guild_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn world_ids(&self) -> BTreeSet<&WorldId> {
        self.entries.values().collect()
    }

    pub fn world_count(&self) -> usize {
        self.world_ids().len()
    }

    /// Number of guilds assigned to each world.
    pub fn world_populations(&self) -> BTreeMap<&WorldId, usize> {
        let mut populations = BTreeMap::new();
        for world in self.entries.values() {
            *populations.entry(world).or_insert(0usize) += 1;
        }
        populations
    }
}

impl FromIterator<(String, WorldId)> for WorldAssignmentMap {
    fn from_iter<T: IntoIterator<Item = (String, WorldId)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{WorldAssignmentMap, WorldId};

    #[test]
    fn world_id_parse_prefers_numbers() {
        assert_eq!(WorldId::parse("11001"), WorldId::Number(11001));
        assert_eq!(WorldId::parse(" 12003 "), WorldId::Number(12003));
        assert_eq!(
            WorldId::parse("Moogooloo"),
            WorldId::Name("Moogooloo".to_string())
        );
    }

    #[test]
    fn from_json_value_accepts_numbers_and_strings() {
        let mapping = WorldAssignmentMap::from_json_value(&json!({
            "AAA-1": 11001,
            "BBB-2": "11002",
            "CCC-3": "Rall's Rest"
        }))
        .expect("decode");

        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.get("AAA-1"), Some(&WorldId::Number(11001)));
        assert_eq!(mapping.get("BBB-2"), Some(&WorldId::Number(11002)));
        assert_eq!(
            mapping.get("CCC-3"),
            Some(&WorldId::Name("Rall's Rest".to_string()))
        );
    }

    #[test]
    fn from_json_value_rejects_non_objects_and_bad_values() {
        assert!(WorldAssignmentMap::from_json_value(&json!([1, 2])).is_err());
        assert!(WorldAssignmentMap::from_json_value(&json!({"AAA": 1.5})).is_err());
        assert!(WorldAssignmentMap::from_json_value(&json!({"AAA": null})).is_err());
        assert!(WorldAssignmentMap::from_json_value(&json!({"AAA": ""})).is_err());
    }

    #[test]
    fn world_populations_tally_every_guild() {
        let mapping = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 1), ("G3", 2)]);
        let populations = mapping.world_populations();
        assert_eq!(populations.get(&WorldId::Number(1)), Some(&2));
        assert_eq!(populations.get(&WorldId::Number(2)), Some(&1));
        assert_eq!(mapping.world_count(), 2);
    }

    #[test]
    fn serializes_as_plain_object() {
        let mapping = WorldAssignmentMap::from_entries([("G2", 11002), ("G1", 11001)]);
        let encoded = serde_json::to_string(&mapping).expect("encode");
        assert_eq!(encoded, r#"{"G1":11001,"G2":11002}"#);
        let decoded: WorldAssignmentMap = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, mapping);
    }
}
