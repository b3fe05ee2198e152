use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mapping::{WorldAssignmentMap, WorldId};

/// Digest reserved for the empty mapping. Never a valid hex digest.
pub const EMPTY_FINGERPRINT: &str = "empty";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn empty() -> Self {
        Self(EMPTY_FINGERPRINT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty_mapping(&self) -> bool {
        self.0 == EMPTY_FINGERPRINT
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order-independent SHA-256 digest of a mapping.
///
/// Entries are hashed in ascending guild id order. Every field is length- or
/// type-prefixed so distinct mappings cannot collide by concatenation, and a
/// numeric world id never hashes like its textual spelling.
pub fn fingerprint(mapping: &WorldAssignmentMap) -> Fingerprint {
    if mapping.is_empty() {
        return Fingerprint::empty();
    }

    let mut entries = mapping.iter().collect::<Vec<_>>();
    entries.sort_by(|left, right| left.0.cmp(right.0));

    let mut hasher = Sha256::new();
    for (guild_id, world_id) in entries {
        update_text(&mut hasher, guild_id);
        match world_id {
            WorldId::Number(number) => {
                hasher.update([b'n']);
                hasher.update(number.to_be_bytes());
            }
            WorldId::Name(name) => {
                hasher.update([b's']);
                update_text(&mut hasher, name);
            }
        }
    }

    let digest = hasher.finalize();
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Fingerprint(output)
}

fn update_text(hasher: &mut Sha256, value: &str) {
    let length = u64::try_from(value.len()).unwrap_or(u64::MAX);
    hasher.update(length.to_be_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::{EMPTY_FINGERPRINT, fingerprint};
    use crate::mapping::{WorldAssignmentMap, WorldId};

    #[test]
    fn insertion_order_does_not_matter() {
        let forward = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2), ("G3", 3)]);
        let reverse = WorldAssignmentMap::from_entries([("G3", 3), ("G2", 2), ("G1", 1)]);
        assert_eq!(fingerprint(&forward), fingerprint(&reverse));
    }

    #[test]
    fn any_differing_pair_changes_the_digest() {
        let base = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2)]);
        let moved = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 3)]);
        let extra = WorldAssignmentMap::from_entries([("G1", 1), ("G2", 2), ("G3", 2)]);
        let renamed = WorldAssignmentMap::from_entries([("G1", 1), ("G4", 2)]);
        let digest = fingerprint(&base);
        assert_ne!(digest, fingerprint(&moved));
        assert_ne!(digest, fingerprint(&extra));
        assert_ne!(digest, fingerprint(&renamed));
    }

    #[test]
    fn numeric_and_textual_world_ids_are_distinct() {
        let numeric = WorldAssignmentMap::from_entries([("G1", WorldId::Number(11001))]);
        let textual = WorldAssignmentMap::from_entries([("G1", WorldId::Name("11001".into()))]);
        assert_ne!(fingerprint(&numeric), fingerprint(&textual));
    }

    #[test]
    fn concatenation_cannot_collide() {
        let left = WorldAssignmentMap::from_entries([("AB", WorldId::Name("C".into()))]);
        let right = WorldAssignmentMap::from_entries([("A", WorldId::Name("BC".into()))]);
        assert_ne!(fingerprint(&left), fingerprint(&right));
    }

    #[test]
    fn empty_mapping_uses_sentinel() {
        let empty = fingerprint(&WorldAssignmentMap::new());
        assert_eq!(empty.as_str(), EMPTY_FINGERPRINT);
        assert!(empty.is_empty_mapping());

        let single = fingerprint(&WorldAssignmentMap::from_entries([("G1", 1)]));
        assert_ne!(single, empty);
        assert!(!single.is_empty_mapping());
        assert_eq!(single.as_str().len(), 64);
    }
}
