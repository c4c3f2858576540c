//! Partial-work directives for distributed builds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::FieldMap;

/// A map of builder-attribute overrides restricting `get_items` to a
/// disjoint subset of the total work.
///
/// Applied to a serialized builder description before rehydration; the
/// union of all chunks from one `prechunk` call covers the full work set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkSpec(pub FieldMap);

impl ChunkSpec {
    /// An empty override map (the whole-work fallback chunk).
    #[must_use]
    pub fn empty() -> Self {
        Self(FieldMap::new())
    }

    /// A single-attribute override.
    pub fn with(field: impl Into<String>, value: Value) -> Self {
        let mut map = FieldMap::new();
        map.insert(field.into(), value);
        Self(map)
    }

    /// Merge the overrides into a builder-description argument map.
    pub fn apply_to(&self, args: &mut FieldMap) {
        for (k, v) in &self.0 {
            args.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_overrides_existing_args() {
        let chunk = ChunkSpec::with("query", json!({"op": "all"}));
        let mut args = FieldMap::new();
        args.insert("query".into(), json!(null));
        args.insert("chunk_size".into(), json!(10));
        chunk.apply_to(&mut args);
        assert_eq!(args["query"], json!({"op": "all"}));
        assert_eq!(args["chunk_size"], json!(10));
    }

    #[test]
    fn empty_chunk_is_identity() {
        let mut args = FieldMap::new();
        args.insert("a".into(), json!(1));
        let before = args.clone();
        ChunkSpec::empty().apply_to(&mut args);
        assert_eq!(args, before);
    }
}
