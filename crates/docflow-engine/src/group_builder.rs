//! Many-to-one group builder.
//!
//! Groups source documents by a tuple of fields and produces one merged
//! target document per group. A group is (re)built when any member is
//! newer than the corresponding target document or the group is absent
//! from the target. Orphan deletion is not offered: the reverse
//! relationship from a group back to its members is not well-defined.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};

use docflow_store::Store;
use docflow_types::document::canonical_key;
use docflow_types::{ChunkSpec, Criteria, Document, FieldMap, Query};

use crate::builder::{Builder, ItemStream, DEFAULT_CHUNK_SIZE};
use crate::errors::{BuildError, ItemFailure};

/// The merge function applied to the members of one group.
pub type GroupFn = dyn Fn(&[Document]) -> anyhow::Result<FieldMap> + Send + Sync;

/// GroupBuilder configuration.
#[derive(Clone)]
pub struct GroupOptions {
    /// Extra source criteria applied to every selection.
    pub query: Criteria,
    /// Source fields to fetch; always augmented with the key and
    /// last-updated fields.
    pub projection: Option<Vec<String>>,
    /// Per-group deadline; `None` disables it.
    pub timeout: Option<Duration>,
    /// Embed the wall-clock duration of `process_item` in the output.
    pub store_process_time: bool,
    /// Re-include groups previously marked failed.
    pub retry_failed: bool,
    pub chunk_size: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            query: Criteria::All,
            projection: None,
            timeout: None,
            store_process_time: true,
            retry_failed: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Group source documents and produce one merged document per group (N:1).
pub struct GroupBuilder {
    name: String,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    grouping_keys: Vec<String>,
    options: GroupOptions,
    func: Arc<GroupFn>,
    /// Plural form of the source key: the output field listing all member
    /// keys of a group.
    keys_field: String,
    total: Mutex<Option<u64>>,
}

impl GroupBuilder {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        grouping_keys: Vec<String>,
        func: Arc<GroupFn>,
    ) -> Self {
        Self::with_options(name, source, target, grouping_keys, func, GroupOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        grouping_keys: Vec<String>,
        func: Arc<GroupFn>,
        options: GroupOptions,
    ) -> Self {
        let keys_field = format!("{}s", source.key());
        Self {
            name: name.into(),
            source,
            target,
            grouping_keys,
            options,
            func,
            keys_field,
            total: Mutex::new(None),
        }
    }

    fn ensure_indexes(&self) -> Result<(), BuildError> {
        let checks = [
            self.source.ensure_index(self.source.key(), false)?,
            self.source
                .ensure_index(self.source.last_updated_field(), false)?,
            self.target.ensure_index(self.target.key(), false)?,
            self.target
                .ensure_index(self.target.last_updated_field(), false)?,
            self.target.ensure_index("state", false)?,
            self.target.ensure_index(&self.keys_field, false)?,
        ];
        if !checks.iter().all(|ok| *ok) {
            tracing::warn!(
                builder = %self.name,
                "missing one or more indices on stores; performance on large \
                 stores may be severely degraded"
            );
        }
        Ok(())
    }

    /// Source keys whose groups need (re)building.
    fn ids_to_process(&self) -> Result<Vec<Value>, BuildError> {
        let as_source = |e| BuildError::source(&self.name, e);

        // Keys already folded into target documents; stored as arrays in
        // the plural key field, so unpack.
        let mut processed: HashSet<String> = HashSet::new();
        for value in self
            .target
            .distinct(&self.keys_field, &Criteria::All)
            .map_err(as_source)?
        {
            match value {
                Value::Array(members) => {
                    processed.extend(members.iter().map(canonical_key));
                }
                scalar => {
                    processed.insert(canonical_key(&scalar));
                }
            }
        }

        if self.options.retry_failed {
            let failed = Criteria::eq("state", json!("failed"));
            for value in self
                .target
                .distinct(&self.keys_field, &failed)
                .map_err(as_source)?
            {
                match value {
                    Value::Array(members) => {
                        for m in &members {
                            processed.remove(&canonical_key(m));
                        }
                    }
                    scalar => {
                        processed.remove(&canonical_key(&scalar));
                    }
                }
            }
        }

        let all = self
            .source
            .distinct(self.source.key(), &self.options.query)
            .map_err(as_source)?;
        tracing::debug!(builder = %self.name, total = all.len(), "Found source docs");

        let mut seen: HashSet<String> = HashSet::new();
        let mut ids: Vec<Value> = Vec::new();
        for key in all {
            let encoded = canonical_key(&key);
            if !processed.contains(&encoded) && seen.insert(encoded) {
                ids.push(key);
            }
        }

        let newer = self
            .source
            .newer_in(self.target.as_ref(), &self.options.query, false)
            .map_err(as_source)?;
        for key in newer {
            if seen.insert(canonical_key(&key)) {
                ids.push(key);
            }
        }

        tracing::info!(builder = %self.name, ids = ids.len(), "Found IDs to process");
        Ok(ids)
    }

    /// The distinct grouping tuples covering `keys`, as field/value maps.
    fn groups_from_keys(&self, keys: &[Value]) -> Result<Vec<Document>, BuildError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut groups: Vec<Document> = Vec::new();
        for batch in keys.chunks(self.options.chunk_size.max(1)) {
            let query = Query::new(Criteria::key_in(self.source.key(), batch.to_vec()))
                .with_properties(self.grouping_keys.clone());
            for doc in self
                .source
                .query(&query)
                .map_err(|e| BuildError::source(&self.name, e))?
            {
                let mut group = Document::new();
                for field in &self.grouping_keys {
                    group.set(field.clone(), doc.get(field).cloned().unwrap_or(Value::Null));
                }
                let encoded = canonical_key(&group.clone().into_value());
                if seen.insert(encoded) {
                    groups.push(group);
                }
            }
        }
        tracing::info!(builder = %self.name, groups = groups.len(), "Found groups to process");
        Ok(groups)
    }

    fn group_criteria(&self, group: &Document) -> Criteria {
        let mut criteria = self.options.query.clone();
        for field in &self.grouping_keys {
            let value = group.get(field).cloned().unwrap_or(Value::Null);
            criteria = criteria.and(Criteria::eq(field.clone(), value));
        }
        criteria
    }

    fn projection(&self) -> Option<Vec<String>> {
        self.options.projection.as_ref().map(|fields| {
            let mut props: Vec<String> = fields.clone();
            let mut required: Vec<&str> =
                vec![self.source.key(), self.source.last_updated_field()];
            required.extend(self.grouping_keys.iter().map(String::as_str));
            for field in required {
                if !props.iter().any(|p| p == field) {
                    props.push(field.to_string());
                }
            }
            props
        })
    }
}

impl Builder for GroupBuilder {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn sources(&self) -> Vec<Arc<dyn Store>> {
        vec![self.source.clone()]
    }

    fn targets(&self) -> Vec<Arc<dyn Store>> {
        vec![self.target.clone()]
    }

    fn chunk_size(&self) -> usize {
        self.options.chunk_size
    }

    fn total_hint(&self) -> Option<u64> {
        *self.total.lock().ok()?
    }

    fn item_timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    fn prechunk(&self, num_chunks: usize) -> Result<Vec<ChunkSpec>, BuildError> {
        self.ensure_indexes()?;
        let ids = self.ids_to_process()?;
        let groups = self.groups_from_keys(&ids)?;
        if groups.is_empty() {
            return Ok(vec![ChunkSpec::empty()]);
        }
        let per_chunk = groups.len().div_ceil(num_chunks.max(1));
        let mut chunks = Vec::new();
        for split in groups.chunks(per_chunk) {
            let clauses: Vec<Criteria> = split
                .iter()
                .map(|group| {
                    let mut clauses = Vec::with_capacity(self.grouping_keys.len());
                    for field in &self.grouping_keys {
                        clauses.push(Criteria::eq(
                            field.clone(),
                            group.get(field).cloned().unwrap_or(Value::Null),
                        ));
                    }
                    Criteria::And { clauses }
                })
                .collect();
            let criteria = Criteria::Or { clauses };
            let value = serde_json::to_value(&criteria)
                .map_err(|e| BuildError::Config(format!("unserializable chunk query: {e}")))?;
            chunks.push(ChunkSpec::with("query", value));
        }
        Ok(chunks)
    }

    fn get_items(&self) -> Result<ItemStream, BuildError> {
        tracing::info!(builder = %self.name, "Starting group builder");
        self.ensure_indexes()?;

        let ids = self.ids_to_process()?;
        let groups = self.groups_from_keys(&ids)?;
        if let Ok(mut total) = self.total.lock() {
            *total = Some(groups.len() as u64);
        }

        let source = self.source.clone();
        let name = self.name.clone();
        let projection = self.projection();
        let criteria: VecDeque<Criteria> =
            groups.iter().map(|g| self.group_criteria(g)).collect();
        let mut pending = criteria;

        Ok(Box::new(std::iter::from_fn(move || {
            let criteria = pending.pop_front()?;
            let mut query = Query::new(criteria);
            if let Some(props) = projection.clone() {
                query = query.with_properties(props);
            }
            match source.query(&query) {
                Ok(stream) => {
                    let members: Vec<Value> =
                        stream.map(Document::into_value).collect();
                    Some(Ok(Value::Array(members)))
                }
                Err(err) => {
                    pending.clear();
                    Some(Err(BuildError::source(&name, err)))
                }
            }
        })))
    }

    fn process_item(&self, item: Value) -> Result<Value, ItemFailure> {
        let members: Vec<Document> = match item {
            Value::Array(values) => values
                .into_iter()
                .map(|v| {
                    Document::from_value(v)
                        .ok_or_else(|| ItemFailure::error("group member is not a document"))
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(ItemFailure::error("work item is not a group")),
        };
        if members.is_empty() {
            return Err(ItemFailure::error("group has no members"));
        }

        let keys: Vec<Value> = members
            .iter()
            .filter_map(|d| d.get(self.source.key()).cloned())
            .collect();
        tracing::debug!(builder = %self.name, members = keys.len(), "Processing group");

        let started = Instant::now();
        let processed =
            (self.func)(&members).map_err(|e| ItemFailure::error(format!("{e:#}")))?;
        let elapsed = started.elapsed().as_secs_f64();

        let last_updated = members
            .iter()
            .map(|d| d.last_updated_or_epoch(self.source.last_updated_field()))
            .max()
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        let mut out = Document::new();
        out.set(
            self.target.key(),
            keys.first().cloned().unwrap_or(Value::Null),
        );
        out.set(self.keys_field.clone(), Value::Array(keys));
        out.set(self.target.last_updated_field(), json!(last_updated));
        for field in &self.grouping_keys {
            if let Some(value) = members[0].get(field) {
                out.set(field.clone(), value.clone());
            }
        }
        if self.options.store_process_time {
            out.set("_process_time", json!(elapsed));
        }
        for (field, value) in processed {
            out.set(field, value);
        }
        out.set("state", json!("successful"));
        Ok(out.into_value())
    }

    fn on_item_error(&self, item: &Value, failure: &ItemFailure) -> Option<Value> {
        let members = item.as_array()?;
        let keys: Vec<Value> = members
            .iter()
            .filter_map(|v| v.get(self.source.key()).cloned())
            .collect();
        let mut out = Document::new();
        out.set(self.target.key(), keys.first().cloned()?);
        out.set(self.keys_field.clone(), Value::Array(keys));
        out.set(
            self.target.last_updated_field(),
            json!(Utc::now().to_rfc3339()),
        );
        for field in &self.grouping_keys {
            if let Some(value) = members.first().and_then(|m| m.get(field)) {
                out.set(field.clone(), value.clone());
            }
        }
        out.set("error", json!(failure.to_string()));
        out.set("state", json!("failed"));
        Some(out.into_value())
    }

    fn update_targets(&self, batch: &[Value]) -> Result<(), BuildError> {
        let stamp = Utc::now().to_rfc3339();
        let mut docs = Vec::with_capacity(batch.len());
        for value in batch {
            let mut doc = Document::from_value(value.clone())
                .ok_or_else(|| BuildError::sink(&self.name, "processed item is not a document"))?;
            doc.set("_bt", json!(stamp.clone()));
            docs.push(doc);
        }
        if !docs.is_empty() {
            self.target
                .update(docs, None)
                .map_err(|e| BuildError::sink(&self.name, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_store::MemoryStore;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn fixture() -> (Arc<dyn Store>, Arc<dyn Store>) {
        let source = MemoryStore::with_fields("src", "n", "last_updated");
        source.connect().unwrap();
        source
            .update(
                vec![
                    doc(json!({"n": "apple", "t": "fruit", "q": 3,
                               "last_updated": "2026-01-01T00:00:00Z"})),
                    doc(json!({"n": "pear", "t": "fruit", "q": 5,
                               "last_updated": "2026-01-01T00:00:00Z"})),
                    doc(json!({"n": "cod", "t": "fish", "q": 1,
                               "last_updated": "2026-01-01T00:00:00Z"})),
                ],
                None,
            )
            .unwrap();
        let target = MemoryStore::with_fields("dst", "n", "last_updated");
        target.connect().unwrap();
        (Arc::new(source), Arc::new(target))
    }

    fn sum_quantities(members: &[Document]) -> anyhow::Result<FieldMap> {
        let total: i64 = members
            .iter()
            .filter_map(|d| d.get("q").and_then(Value::as_i64))
            .sum();
        let mut out = FieldMap::new();
        out.insert("total_q".into(), json!(total));
        Ok(out)
    }

    fn builder(source: Arc<dyn Store>, target: Arc<dyn Store>) -> GroupBuilder {
        GroupBuilder::new(
            "by-type",
            source,
            target,
            vec!["t".into()],
            Arc::new(sum_quantities),
        )
    }

    #[test]
    fn groups_by_tuple() {
        let (source, target) = fixture();
        let b = builder(source, target);
        let items: Vec<Value> = b.get_items().unwrap().map(Result::unwrap).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(b.total_hint(), Some(2));
        let sizes: Vec<usize> = items
            .iter()
            .map(|i| i.as_array().unwrap().len())
            .collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[test]
    fn process_item_merges_group() {
        let (source, target) = fixture();
        let b = builder(source, target);
        let group = json!([
            {"n": "apple", "t": "fruit", "q": 3, "last_updated": "2026-01-01T00:00:00Z"},
            {"n": "pear", "t": "fruit", "q": 5, "last_updated": "2026-01-02T00:00:00Z"},
        ]);
        let out = b.process_item(group).unwrap();
        assert_eq!(out["total_q"], json!(8));
        assert_eq!(out["ns"], json!(["apple", "pear"]));
        assert_eq!(out["t"], json!("fruit"));
        assert_eq!(out["state"], json!("successful"));
        assert_eq!(out["last_updated"], json!("2026-01-02T00:00:00+00:00"));
    }

    #[test]
    fn failed_group_is_marked() {
        let (source, target) = fixture();
        let b = GroupBuilder::new(
            "by-type",
            source,
            target,
            vec!["t".into()],
            Arc::new(|_: &[Document]| anyhow::bail!("merge exploded")),
        );
        let group = json!([{"n": "cod", "t": "fish", "q": 1}]);
        let failure = b.process_item(group.clone()).unwrap_err();
        let marked = b.on_item_error(&group, &failure).unwrap();
        assert_eq!(marked["state"], json!("failed"));
        assert_eq!(marked["ns"], json!(["cod"]));
        assert!(marked["error"].as_str().unwrap().contains("merge exploded"));
    }

    #[test]
    fn rerun_without_changes_selects_nothing() {
        let (source, target) = fixture();
        let b = builder(source.clone(), target.clone());
        let groups: Vec<Value> = b.get_items().unwrap().map(Result::unwrap).collect();
        let processed: Vec<Value> = groups
            .into_iter()
            .map(|g| b.process_item(g).unwrap())
            .collect();
        b.update_targets(&processed).unwrap();

        let again: Vec<Value> = b.get_items().unwrap().map(Result::unwrap).collect();
        assert!(again.is_empty(), "unchanged groups must not be reselected");
    }

    #[test]
    fn prechunk_splits_groups() {
        let (source, target) = fixture();
        let b = builder(source, target);
        let chunks = b.prechunk(2).unwrap();
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert!(chunk.0.contains_key("query"));
        }
    }
}
