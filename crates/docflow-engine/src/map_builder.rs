//! One-to-one map builder.
//!
//! Applies a unary function to yield one target document per source
//! document, with incremental selection: a source document is rebuilt only
//! when it is newer (by last-updated) than its counterpart in the target,
//! absent from the target, or previously marked failed when retries are
//! enabled.

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

/// The unary transform applied to each source document.
///
/// Values for the source key and last-updated fields in the output are
/// ignored; the builder supplies them. Errors are caught, counted, and
/// recorded on the target document as `{state: "failed", error: …}`.
pub type UnaryFn = dyn Fn(&Document) -> anyhow::Result<FieldMap> + Send + Sync;

/// MapBuilder configuration.
#[derive(Clone)]
pub struct MapOptions {
    /// Extra source criteria applied to every selection.
    pub query: Criteria,
    /// Source fields to fetch; always augmented with the key and
    /// last-updated fields.
    pub projection: Option<Vec<String>>,
    /// After all updates, delete target documents whose key is absent
    /// from the source.
    pub delete_orphans: bool,
    /// Per-item deadline; `None` disables it.
    pub timeout: Option<Duration>,
    /// Embed the wall-clock duration of `process_item` in the output as
    /// `_process_time`.
    pub store_process_time: bool,
    /// Re-include items previously marked failed.
    pub retry_failed: bool,
    pub chunk_size: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            query: Criteria::All,
            projection: None,
            delete_orphans: false,
            timeout: None,
            store_process_time: true,
            retry_failed: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Apply a unary function to each source document (1:1).
pub struct MapBuilder {
    name: String,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    options: MapOptions,
    func: Arc<UnaryFn>,
    total: Mutex<Option<u64>>,
}

impl MapBuilder {
    /// Build with default options.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        func: Arc<UnaryFn>,
    ) -> Self {
        Self::with_options(name, source, target, func, MapOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        func: Arc<UnaryFn>,
        options: MapOptions,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            options,
            func,
            total: Mutex::new(None),
        }
    }

    /// The identity map builder: sync a source store into a target store.
    pub fn copy(
        name: impl Into<String>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        options: MapOptions,
    ) -> Self {
        Self::with_options(
            name,
            source,
            target,
            Arc::new(|doc: &Document| Ok(doc.fields().clone())),
            options,
        )
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

    /// Keys needing work: newer in source than target, absent from target,
    /// plus previously-failed keys when retries are enabled.
    fn select_keys(&self) -> Result<Vec<Value>, BuildError> {
        let updated = self
            .source
            .newer_in(self.target.as_ref(), &self.options.query, true)
            .map_err(|e| BuildError::source(&self.name, e))?;
        let mut seen: HashSet<String> = updated.iter().map(canonical_key).collect();
        let mut keys = updated;

        let target_keys: HashSet<String> = self
            .target
            .distinct(self.target.key(), &Criteria::All)
            .map_err(|e| BuildError::source(&self.name, e))?
            .iter()
            .map(canonical_key)
            .collect();
        for key in self
            .source
            .distinct(self.source.key(), &self.options.query)
            .map_err(|e| BuildError::source(&self.name, e))?
        {
            let encoded = canonical_key(&key);
            if !target_keys.contains(&encoded) && seen.insert(encoded) {
                keys.push(key);
            }
        }

        if self.options.retry_failed {
            let failed = self
                .options
                .query
                .clone()
                .and(Criteria::eq("state", json!("failed")));
            for key in self
                .target
                .distinct(self.target.key(), &failed)
                .map_err(|e| BuildError::source(&self.name, e))?
            {
                if seen.insert(canonical_key(&key)) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    fn projection(&self) -> Option<Vec<String>> {
        self.options.projection.as_ref().map(|fields| {
            let mut props: Vec<String> = fields.clone();
            for required in [self.source.key(), self.source.last_updated_field()] {
                if !props.iter().any(|p| p == required) {
                    props.push(required.to_string());
                }
            }
            props
        })
    }
}

impl Builder for MapBuilder {
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
        let keys = self.select_keys()?;
        if keys.is_empty() {
            return Ok(vec![ChunkSpec::empty()]);
        }
        let per_chunk = keys.len().div_ceil(num_chunks.max(1));
        let mut chunks = Vec::new();
        for split in keys.chunks(per_chunk) {
            let criteria = Criteria::key_in(self.source.key(), split.to_vec());
            let value = serde_json::to_value(&criteria)
                .map_err(|e| BuildError::Config(format!("unserializable chunk query: {e}")))?;
            chunks.push(ChunkSpec::with("query", value));
        }
        Ok(chunks)
    }

    fn get_items(&self) -> Result<ItemStream, BuildError> {
        tracing::info!(builder = %self.name, "Starting map builder");
        self.ensure_indexes()?;

        let keys = self.select_keys()?;
        tracing::info!(builder = %self.name, items = keys.len(), "Selected items to process");
        if let Ok(mut total) = self.total.lock() {
            *total = Some(keys.len() as u64);
        }

        let source = self.source.clone();
        let name = self.name.clone();
        let key_field = source.key().to_string();
        let projection = self.projection();
        let chunk = self.options.chunk_size.max(1);
        let mut pending: VecDeque<Value> = keys.into();
        let mut buffer: VecDeque<Document> = VecDeque::new();

        Ok(Box::new(std::iter::from_fn(move || loop {
            if let Some(doc) = buffer.pop_front() {
                return Some(Ok(doc.into_value()));
            }
            if pending.is_empty() {
                return None;
            }
            let take = chunk.min(pending.len());
            let batch: Vec<Value> = pending.drain(..take).collect();
            let mut query = Query::new(Criteria::key_in(key_field.clone(), batch));
            if let Some(props) = projection.clone() {
                query = query.with_properties(props);
            }
            match source.query(&query) {
                Ok(stream) => buffer.extend(stream),
                Err(err) => {
                    pending.clear();
                    return Some(Err(BuildError::source(&name, err)));
                }
            }
        })))
    }

    fn process_item(&self, item: Value) -> Result<Value, ItemFailure> {
        let doc = Document::from_value(item)
            .ok_or_else(|| ItemFailure::error("work item is not a document"))?;
        let key = doc
            .get(self.source.key())
            .cloned()
            .ok_or_else(|| {
                ItemFailure::error(format!(
                    "work item is missing key field '{}'",
                    self.source.key()
                ))
            })?;
        tracing::debug!(builder = %self.name, key = %key, "Processing item");

        let started = Instant::now();
        let processed = (self.func)(&doc).map_err(|e| ItemFailure::error(format!("{e:#}")))?;
        let elapsed = started.elapsed().as_secs_f64();

        let last_updated = doc
            .timestamp(self.source.last_updated_field())
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        let mut out = Document::new();
        out.set(self.target.key(), key);
        out.set(self.target.last_updated_field(), json!(last_updated));
        if self.options.store_process_time {
            out.set("_process_time", json!(elapsed));
        }
        for (field, value) in processed {
            if field != self.source.key() && field != self.source.last_updated_field() {
                out.set(field, value);
            }
        }
        out.set("state", json!("successful"));
        Ok(out.into_value())
    }

    fn on_item_error(&self, item: &Value, failure: &ItemFailure) -> Option<Value> {
        let doc = Document::from_value(item.clone())?;
        let key = doc.get(self.source.key())?.clone();
        let last_updated = doc
            .timestamp(self.source.last_updated_field())
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        let mut out = Document::new();
        out.set(self.target.key(), key);
        out.set(self.target.last_updated_field(), json!(last_updated));
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

    fn finalize(&self) -> Result<(), BuildError> {
        if self.options.delete_orphans {
            let source_keys: HashSet<String> = self
                .source
                .distinct(self.source.key(), &self.options.query)?
                .iter()
                .map(canonical_key)
                .collect();
            let orphans: Vec<Value> = self
                .target
                .distinct(self.target.key(), &Criteria::All)?
                .into_iter()
                .filter(|k| !source_keys.contains(&canonical_key(k)))
                .collect();
            if !orphans.is_empty() {
                tracing::info!(
                    builder = %self.name,
                    orphans = orphans.len(),
                    "Finalize: deleting orphaned documents"
                );
                self.target
                    .remove_docs(&Criteria::key_in(self.target.key(), orphans))?;
            }
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

    fn stores(source_docs: Vec<Value>) -> (Arc<dyn Store>, Arc<dyn Store>) {
        let source = MemoryStore::with_fields("src", "name", "last_updated");
        source.connect().unwrap();
        source
            .update(source_docs.into_iter().map(doc).collect(), None)
            .unwrap();
        let target = MemoryStore::with_fields("dst", "name", "last_updated");
        target.connect().unwrap();
        (Arc::new(source), Arc::new(target))
    }

    fn double(doc: &Document) -> anyhow::Result<FieldMap> {
        let v = doc
            .get("v")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("missing v"))?;
        let mut out = FieldMap::new();
        out.insert("v".into(), json!(v * 2));
        Ok(out)
    }

    #[test]
    fn selects_everything_against_empty_target() {
        let (source, target) = stores(vec![
            json!({"name": "a", "v": 1, "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "b", "v": 2, "last_updated": "2026-01-02T00:00:00Z"}),
        ]);
        let builder = MapBuilder::new("double", source, target, Arc::new(double));
        let items: Vec<_> = builder.get_items().unwrap().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(builder.total_hint(), Some(2));
    }

    #[test]
    fn process_item_doubles_and_stamps() {
        let (source, target) = stores(vec![]);
        let builder = MapBuilder::new("double", source, target, Arc::new(double));
        let out = builder
            .process_item(json!({"name": "a", "v": 3, "last_updated": "2026-01-01T00:00:00Z"}))
            .unwrap();
        assert_eq!(out["v"], json!(6));
        assert_eq!(out["name"], json!("a"));
        assert_eq!(out["state"], json!("successful"));
        assert_eq!(out["last_updated"], json!("2026-01-01T00:00:00+00:00"));
        assert!(out.get("_process_time").is_some());
    }

    #[test]
    fn process_item_error_marks_failed() {
        let (source, target) = stores(vec![]);
        let builder = MapBuilder::new("double", source, target, Arc::new(double));
        let item = json!({"name": "b", "last_updated": "2026-01-01T00:00:00Z"});
        let failure = builder.process_item(item.clone()).unwrap_err();
        let marked = builder.on_item_error(&item, &failure).unwrap();
        assert_eq!(marked["state"], json!("failed"));
        assert_eq!(marked["name"], json!("b"));
        assert!(marked["error"].as_str().unwrap().contains("missing v"));
    }

    #[test]
    fn update_targets_stamps_bt() {
        let (source, target) = stores(vec![]);
        let builder =
            MapBuilder::new("double", source, target.clone(), Arc::new(double));
        builder
            .update_targets(&[json!({"name": "a", "v": 2})])
            .unwrap();
        let written = target
            .query_one(&Query::new(Criteria::eq("name", json!("a"))))
            .unwrap()
            .unwrap();
        assert!(written.contains("_bt"));
    }

    #[test]
    fn prechunk_covers_all_keys_disjointly() {
        let (source, target) = stores(vec![
            json!({"name": "a", "v": 1, "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "b", "v": 2, "last_updated": "2026-01-01T00:00:00Z"}),
            json!({"name": "c", "v": 3, "last_updated": "2026-01-01T00:00:00Z"}),
        ]);
        let builder = MapBuilder::new("double", source, target, Arc::new(double));
        let chunks = builder.prechunk(2).unwrap();
        assert_eq!(chunks.len(), 2);
        let mut covered = Vec::new();
        for chunk in &chunks {
            let criteria: Criteria =
                serde_json::from_value(chunk.0["query"].clone()).unwrap();
            match criteria {
                Criteria::In { values, .. } => covered.extend(values),
                other => panic!("unexpected chunk criteria: {other:?}"),
            }
        }
        covered.sort_by_key(canonical_key);
        assert_eq!(covered, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn projection_is_augmented_with_key_fields() {
        let (source, target) = stores(vec![]);
        let options = MapOptions {
            projection: Some(vec!["v".into()]),
            ..MapOptions::default()
        };
        let builder =
            MapBuilder::with_options("double", source, target, Arc::new(double), options);
        let props = builder.projection().unwrap();
        assert!(props.contains(&"v".to_string()));
        assert!(props.contains(&"name".to_string()));
        assert!(props.contains(&"last_updated".to_string()));
    }
}
