//! In-memory [`Store`] implementation.
//!
//! The reference adapter for tests and single-host builds. Documents live
//! in a `BTreeMap` behind `std::sync::RwLock`, keyed by the canonical
//! encoding of the key value, which keeps iteration order stable and
//! enforces key uniqueness.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use docflow_types::document::canonical_key;
use docflow_types::{Criteria, Document, Query, SortDirection};

use crate::error::{Result, StoreError};
use crate::store::{DocStream, Store};
use crate::validator::Validator;

/// Default key field, matching the historical convention of the source
/// deployments this engine was built for.
pub const DEFAULT_KEY: &str = "task_id";

/// Default last-updated field.
pub const DEFAULT_LAST_UPDATED: &str = "last_updated";

/// In-memory document store.
pub struct MemoryStore {
    name: String,
    key_field: String,
    lu_field: String,
    connected: AtomicBool,
    validator: Option<Arc<dyn Validator>>,
    docs: RwLock<BTreeMap<String, Document>>,
    indexes: RwLock<HashSet<String>>,
}

impl MemoryStore {
    /// Create a store with the default key and last-updated fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_fields(name, DEFAULT_KEY, DEFAULT_LAST_UPDATED)
    }

    /// Create a store with explicit key and last-updated fields.
    pub fn with_fields(
        name: impl Into<String>,
        key: impl Into<String>,
        last_updated_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_field: key.into(),
            lu_field: last_updated_field.into(),
            connected: AtomicBool::new(false),
            validator: None,
            docs: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(HashSet::new()),
        }
    }

    /// Attach a validator applied to every document on `update`.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// All documents in key order. Used by write-through wrappers.
    pub fn dump(&self) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(docs.values().cloned().collect())
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected {
                store: self.name.clone(),
            })
        }
    }

    fn validate(&self, doc: &Document) -> Result<()> {
        if let Some(validator) = &self.validator {
            let reasons = validator.validation_errors(doc);
            if !reasons.is_empty() {
                return Err(StoreError::Validation { reasons });
            }
        }
        Ok(())
    }
}

/// Total order over JSON values used for sorting query results.
///
/// Missing fields and nulls sort first, then booleans, numbers, strings,
/// and finally composites by their canonical encoding.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (x, y) if rank(x) == rank(y) => {
            let cx = x.map(canonical_key).unwrap_or_default();
            let cy = y.map(canonical_key).unwrap_or_default();
            cx.cmp(&cy)
        }
        (x, y) => rank(x).cmp(&rank(y)),
    }
}

impl Store for MemoryStore {
    fn name(&self) -> String {
        format!("mem://{}", self.name)
    }

    fn key(&self) -> &str {
        &self.key_field
    }

    fn last_updated_field(&self) -> &str {
        &self.lu_field
    }

    fn connect(&self) -> Result<()> {
        self.connected.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn count(&self, criteria: &Criteria) -> Result<u64> {
        self.require_connected()?;
        let docs = self.docs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(docs.values().filter(|d| criteria.matches(d)).count() as u64)
    }

    fn query(&self, query: &Query) -> Result<DocStream> {
        self.require_connected()?;
        let docs = self.docs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut hits: Vec<Document> = docs
            .values()
            .filter(|d| query.criteria.matches(d))
            .cloned()
            .collect();
        drop(docs);

        if let Some(sort) = &query.sort {
            let field = sort.field.clone();
            hits.sort_by(|a, b| {
                let ord = cmp_values(a.get(&field), b.get(&field));
                match sort.direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            });
        }

        let skipped = hits.into_iter().skip(query.skip);
        let limited: Vec<Document> = match query.limit {
            Some(n) => skipped.take(n).collect(),
            None => skipped.collect(),
        };

        let projected: Vec<Document> = match &query.properties {
            Some(props) => {
                let props = props.clone();
                limited.into_iter().map(|d| d.project(&props)).collect()
            }
            None => limited,
        };

        Ok(Box::new(projected.into_iter()))
    }

    fn update(&self, docs: Vec<Document>, key_fields: Option<&[String]>) -> Result<()> {
        self.require_connected()?;
        let default_keys = [self.key_field.clone()];
        let keys: &[String] = key_fields.unwrap_or(&default_keys);

        let mut map = self.docs.write().map_err(|_| StoreError::LockPoisoned)?;
        for doc in docs {
            self.validate(&doc)?;

            for field in keys {
                if !doc.contains(field) {
                    return Err(StoreError::MissingKey {
                        store: self.name.clone(),
                        field: field.clone(),
                    });
                }
            }

            if keys.len() == 1 && keys[0] == self.key_field {
                let slot = doc
                    .get(&self.key_field)
                    .map(canonical_key)
                    .unwrap_or_default();
                map.insert(slot, doc);
                continue;
            }

            // Composite upsert: replace the first document matching every
            // key field, otherwise insert under the store key (or the
            // composite encoding when the store key is absent).
            let existing = map
                .iter()
                .find(|(_, d)| keys.iter().all(|f| d.get(f) == doc.get(f)))
                .map(|(slot, _)| slot.clone());
            let slot = existing.unwrap_or_else(|| {
                doc.get(&self.key_field).map(canonical_key).unwrap_or_else(|| {
                    let composite: Vec<Value> =
                        keys.iter().filter_map(|f| doc.get(f).cloned()).collect();
                    canonical_key(&Value::Array(composite))
                })
            });
            map.insert(slot, doc);
        }
        Ok(())
    }

    fn remove_docs(&self, criteria: &Criteria) -> Result<u64> {
        self.require_connected()?;
        let mut map = self.docs.write().map_err(|_| StoreError::LockPoisoned)?;
        let before = map.len();
        map.retain(|_, d| !criteria.matches(d));
        Ok((before - map.len()) as u64)
    }

    fn ensure_index(&self, field: &str, _unique: bool) -> Result<bool> {
        let mut indexes = self.indexes.write().map_err(|_| StoreError::LockPoisoned)?;
        indexes.insert(field.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_types::SortSpec;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn store_with(docs: Vec<Value>) -> MemoryStore {
        let store = MemoryStore::with_fields("test", "name", "last_updated");
        store.connect().unwrap();
        store
            .update(docs.into_iter().map(doc).collect(), None)
            .unwrap();
        store
    }

    #[test]
    fn operations_require_connect() {
        let store = MemoryStore::new("t");
        let err = store.count(&Criteria::All).unwrap_err();
        assert!(matches!(err, StoreError::NotConnected { .. }));
        store.connect().unwrap();
        assert_eq!(store.count(&Criteria::All).unwrap(), 0);
    }

    #[test]
    fn connect_is_idempotent() {
        let store = store_with(vec![json!({"name": "a"})]);
        store.connect().unwrap();
        store.connect().unwrap();
        assert_eq!(store.count(&Criteria::All).unwrap(), 1);
    }

    #[test]
    fn update_upserts_on_key() {
        let store = store_with(vec![json!({"name": "a", "v": 1})]);
        store
            .update(vec![doc(json!({"name": "a", "v": 2}))], None)
            .unwrap();
        assert_eq!(store.count(&Criteria::All).unwrap(), 1);
        let got = store
            .query_one(&Query::new(Criteria::eq("name", json!("a"))))
            .unwrap()
            .unwrap();
        assert_eq!(got.get("v"), Some(&json!(2)));
    }

    #[test]
    fn update_rejects_missing_key() {
        let store = store_with(vec![]);
        let err = store.update(vec![doc(json!({"v": 1}))], None).unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[test]
    fn query_sort_skip_limit() {
        let store = store_with(vec![
            json!({"name": "a", "v": 3}),
            json!({"name": "b", "v": 1}),
            json!({"name": "c", "v": 2}),
        ]);
        let q = Query::all()
            .with_sort(SortSpec::descending("v"))
            .with_skip(1)
            .with_limit(1);
        let hits: Vec<Document> = store.query(&q).unwrap().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("name"), Some(&json!("c")));
    }

    #[test]
    fn query_projects_fields() {
        let store = store_with(vec![json!({"name": "a", "v": 1, "extra": true})]);
        let q = Query::all().with_properties(vec!["name".into()]);
        let hit = store.query(&q).unwrap().next().unwrap();
        assert_eq!(hit.len(), 1);
        assert!(hit.contains("name"));
    }

    #[test]
    fn remove_docs_returns_count() {
        let store = store_with(vec![
            json!({"name": "a", "state": "failed"}),
            json!({"name": "b", "state": "successful"}),
        ]);
        let removed = store
            .remove_docs(&Criteria::eq("state", json!("failed")))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(&Criteria::All).unwrap(), 1);
    }

    #[test]
    fn distinct_dedupes() {
        let store = MemoryStore::with_fields("t", "id", "last_updated");
        store.connect().unwrap();
        store
            .update(
                vec![
                    doc(json!({"id": 1, "t": "fruit"})),
                    doc(json!({"id": 2, "t": "fruit"})),
                    doc(json!({"id": 3, "t": "fish"})),
                ],
                None,
            )
            .unwrap();
        let mut values = store.distinct("t", &Criteria::All).unwrap();
        values.sort_by_key(canonical_key);
        assert_eq!(values, vec![json!("fish"), json!("fruit")]);
    }

    #[test]
    fn groupby_groups_by_tuple() {
        let store = MemoryStore::with_fields("t", "id", "last_updated");
        store.connect().unwrap();
        store
            .update(
                vec![
                    doc(json!({"id": 1, "t": "fruit", "q": 3})),
                    doc(json!({"id": 2, "t": "fruit", "q": 5})),
                    doc(json!({"id": 3, "t": "fish", "q": 1})),
                ],
                None,
            )
            .unwrap();
        let groups = store.groupby(&["t".into()], &Criteria::All).unwrap();
        assert_eq!(groups.len(), 2);
        let fruit = groups
            .iter()
            .find(|(k, _)| k.get("t") == Some(&json!("fruit")))
            .unwrap();
        assert_eq!(fruit.1.len(), 2);
    }

    #[test]
    fn last_updated_empty_store_is_epoch() {
        let store = store_with(vec![]);
        assert_eq!(store.last_updated().unwrap(), docflow_types::epoch());
    }

    #[test]
    fn last_updated_is_max() {
        let store = store_with(vec![
            json!({"name": "a", "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "b", "last_updated": "2026-03-01T00:00:00Z"}),
            json!({"name": "c"}),
        ]);
        assert_eq!(
            store.last_updated().unwrap().to_rfc3339(),
            "2026-03-01T00:00:00+00:00"
        );
    }

    #[test]
    fn newer_in_fast_path_is_superset_of_exhaustive() {
        let source = store_with(vec![
            json!({"name": "a", "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "b", "last_updated": "2026-03-01T00:00:00Z"}),
        ]);
        let target = store_with(vec![
            json!({"name": "a", "last_updated": "2026-02-01T00:00:00Z"}),
        ]);

        let exhaustive = source.newer_in(&target, &Criteria::All, true).unwrap();
        let fast = source.newer_in(&target, &Criteria::All, false).unwrap();
        assert_eq!(exhaustive, vec![json!("b")]);
        for k in &exhaustive {
            assert!(fast.contains(k), "fast path must contain {k}");
        }
    }

    #[test]
    fn newer_in_empty_target_selects_everything() {
        let source = store_with(vec![
            json!({"name": "a", "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "b", "last_updated": "2026-01-02T00:00:00Z"}),
        ]);
        let target = store_with(vec![]);
        let mut keys = source.newer_in(&target, &Criteria::All, true).unwrap();
        keys.sort_by_key(canonical_key);
        assert_eq!(keys, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn validator_rejects_on_update() {
        use crate::validator::RequiredFieldsValidator;
        let store = MemoryStore::with_fields("t", "name", "last_updated")
            .with_validator(Arc::new(RequiredFieldsValidator::new(vec!["v".into()])));
        store.connect().unwrap();
        let err = store
            .update(vec![doc(json!({"name": "a"}))], None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }
}
