//! Tag-keyed registry for serialized store descriptions.
//!
//! A description is a self-describing map whose `type` field selects a
//! registered constructor; the remaining fields are that constructor's
//! arguments. Unknown tags are rejected at load time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::jsonfile::JsonFileStore;
use crate::memory::{MemoryStore, DEFAULT_KEY, DEFAULT_LAST_UPDATED};
use crate::store::Store;

/// Constructor for one registered store type.
pub type StoreCtor = Box<dyn Fn(&Value) -> Result<Arc<dyn Store>> + Send + Sync>;

fn default_key() -> String {
    DEFAULT_KEY.to_string()
}

fn default_last_updated() -> String {
    DEFAULT_LAST_UPDATED.to_string()
}

#[derive(Debug, Deserialize)]
struct MemorySpec {
    name: String,
    #[serde(default = "default_key")]
    key: String,
    #[serde(default = "default_last_updated")]
    last_updated_field: String,
}

#[derive(Debug, Deserialize)]
struct JsonFileSpec {
    name: String,
    path: PathBuf,
    #[serde(default = "default_key")]
    key: String,
    #[serde(default = "default_last_updated")]
    last_updated_field: String,
}

/// Registry of store constructors keyed by stable type tags.
pub struct StoreRegistry {
    ctors: HashMap<String, StoreCtor>,
}

impl StoreRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// A registry with the reference adapters registered under the tags
    /// `memory` and `json_file`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |args| {
            let spec: MemorySpec = serde_json::from_value(args.clone())?;
            Ok(Arc::new(MemoryStore::with_fields(
                spec.name,
                spec.key,
                spec.last_updated_field,
            )) as Arc<dyn Store>)
        });
        registry.register("json_file", |args| {
            let spec: JsonFileSpec = serde_json::from_value(args.clone())?;
            Ok(Arc::new(JsonFileStore::with_fields(
                spec.name,
                spec.path,
                spec.key,
                spec.last_updated_field,
            )) as Arc<dyn Store>)
        });
        registry
    }

    /// Register a constructor under `tag`, replacing any previous one.
    pub fn register<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Store>> + Send + Sync + 'static,
    {
        self.ctors.insert(tag.into(), Box::new(ctor));
    }

    /// Materialize a store from a serialized description.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidSpec`] when the description is not a
    /// map with a string `type` field, [`StoreError::UnknownType`] for an
    /// unregistered tag, and whatever the constructor returns otherwise.
    pub fn from_value(&self, value: &Value) -> Result<Arc<dyn Store>> {
        let map = value
            .as_object()
            .ok_or_else(|| StoreError::InvalidSpec("description must be a map".into()))?;
        let tag = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreError::InvalidSpec("description is missing a string 'type' field".into())
            })?;
        let ctor = self
            .ctors
            .get(tag)
            .ok_or_else(|| StoreError::UnknownType { tag: tag.into() })?;

        let mut args = map.clone();
        args.remove("type");
        ctor(&Value::Object(args))
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_memory_store_with_defaults() {
        let registry = StoreRegistry::with_defaults();
        let store = registry
            .from_value(&json!({"type": "memory", "name": "tasks"}))
            .unwrap();
        assert_eq!(store.key(), "task_id");
        assert_eq!(store.last_updated_field(), "last_updated");
        assert_eq!(store.name(), "mem://tasks");
    }

    #[test]
    fn builds_memory_store_with_explicit_fields() {
        let registry = StoreRegistry::with_defaults();
        let store = registry
            .from_value(&json!({
                "type": "memory",
                "name": "t",
                "key": "name",
                "last_updated_field": "lu",
            }))
            .unwrap();
        assert_eq!(store.key(), "name");
        assert_eq!(store.last_updated_field(), "lu");
    }

    #[test]
    fn builds_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.jsonl");
        let registry = StoreRegistry::with_defaults();
        let store = registry
            .from_value(&json!({
                "type": "json_file",
                "name": "t",
                "path": path.to_str().unwrap(),
                "key": "name",
            }))
            .unwrap();
        store.connect().unwrap();
        assert_eq!(store.key(), "name");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = StoreRegistry::with_defaults();
        let err = registry
            .from_value(&json!({"type": "mongo", "name": "t"}))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::UnknownType { .. }));
    }

    #[test]
    fn missing_tag_is_rejected() {
        let registry = StoreRegistry::with_defaults();
        let err = registry
            .from_value(&json!({"name": "t"}))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::InvalidSpec(_)));
    }
}
