//! The Store capability trait.
//!
//! A Store is a named handle to a collection of documents with one field
//! designated the unique key and one the last-updated timestamp. The trait
//! is object-safe and implementations must be `Send + Sync` for use behind
//! `Arc<dyn Store>`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use docflow_types::document::canonical_key;
use docflow_types::{epoch, Criteria, Document, Query, SortSpec};

use crate::error::Result;

/// A lazy, finite, non-restartable sequence of documents.
pub type DocStream = Box<dyn Iterator<Item = Document> + Send>;

/// Uniform document access surface consumed by the build engine.
pub trait Store: Send + Sync {
    /// A string identifying this data source.
    fn name(&self) -> String;

    /// Field holding each document's unique identifier.
    fn key(&self) -> &str;

    /// Field holding each document's last-updated timestamp.
    fn last_updated_field(&self) -> &str;

    /// Acquire the underlying connection. Re-entrant connects are
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) if the backend cannot be
    /// reached or its on-disk state cannot be loaded.
    fn connect(&self) -> Result<()>;

    /// Release the underlying connection. Safe to call on all exit paths.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn close(&self) -> Result<()>;

    /// Count documents matching `criteria`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn count(&self, criteria: &Criteria) -> Result<u64>;

    /// Produce the documents matching a query, honoring projection, sort,
    /// skip, and limit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn query(&self, query: &Query) -> Result<DocStream>;

    /// Bulk upsert keyed by `key_fields` (the store key when `None`).
    /// Idempotent on the composite key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure, a
    /// document missing a key field, or validator rejection.
    fn update(&self, docs: Vec<Document>, key_fields: Option<&[String]>) -> Result<()>;

    /// Delete documents matching `criteria`, returning how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn remove_docs(&self, criteria: &Criteria) -> Result<u64>;

    /// Idempotently create an index on `field`. Returns whether the index
    /// exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn ensure_index(&self, field: &str, unique: bool) -> Result<bool>;

    /// First document matching the query, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn query_one(&self, query: &Query) -> Result<Option<Document>> {
        Ok(self.query(query)?.next())
    }

    /// Distinct values of `field` across documents matching `criteria`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>> {
        let query = Query::new(criteria.clone()).with_properties(vec![field.to_string()]);
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for doc in self.query(&query)? {
            if let Some(v) = doc.get(field) {
                if seen.insert(canonical_key(v)) {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    /// Group documents matching `criteria` by the tuple of values in
    /// `fields`. The group key is a document mapping each field to its
    /// value in the group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn groupby(
        &self,
        fields: &[String],
        criteria: &Criteria,
    ) -> Result<Vec<(Document, Vec<Document>)>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (Document, Vec<Document>)> = HashMap::new();
        for doc in self.query(&Query::new(criteria.clone()))? {
            let mut key_doc = Document::new();
            for f in fields {
                key_doc.set(f.clone(), doc.get(f).cloned().unwrap_or(Value::Null));
            }
            let encoded = canonical_key(&key_doc.clone().into_value());
            match groups.get_mut(&encoded) {
                Some((_, members)) => members.push(doc),
                None => {
                    order.push(encoded.clone());
                    groups.insert(encoded, (key_doc, vec![doc]));
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|k| groups.remove(&k))
            .collect())
    }

    /// The most recent last-updated timestamp in the store, or the epoch
    /// sentinel when the store is empty or untimestamped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn last_updated(&self) -> Result<DateTime<Utc>> {
        let lu_field = self.last_updated_field().to_string();
        let query = Query::all()
            .with_properties(vec![lu_field.clone()])
            .with_sort(SortSpec::descending(lu_field.clone()))
            .with_limit(1);
        Ok(self
            .query_one(&query)?
            .map(|doc| doc.last_updated_or_epoch(&lu_field))
            .unwrap_or_else(epoch))
    }

    /// Keys of documents that are newer in `self` than in `other`,
    /// subject to `criteria` on `self`.
    ///
    /// With `exhaustive = false` this uses the max-timestamp shortcut:
    /// every key in `self` whose last-updated exceeds
    /// `other.last_updated()`. With `exhaustive = true` each key is
    /// compared against its counterpart in `other`; keys absent from
    /// `other` compare against the epoch sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on backend failure.
    fn newer_in(
        &self,
        other: &dyn Store,
        criteria: &Criteria,
        exhaustive: bool,
    ) -> Result<Vec<Value>> {
        self.ensure_index(self.key(), false)?;
        self.ensure_index(self.last_updated_field(), false)?;

        if exhaustive {
            let other_key = other.key().to_string();
            let other_lu = other.last_updated_field().to_string();
            let props = vec![other_key.clone(), other_lu.clone()];
            let mut other_dates: HashMap<String, DateTime<Utc>> = HashMap::new();
            for doc in other.query(&Query::all().with_properties(props))? {
                if let Some(k) = doc.get(&other_key) {
                    other_dates.insert(canonical_key(k), doc.last_updated_or_epoch(&other_lu));
                }
            }

            let key_field = self.key().to_string();
            let lu_field = self.last_updated_field().to_string();
            let query = Query::new(criteria.clone())
                .with_properties(vec![key_field.clone(), lu_field.clone()]);
            let mut out = Vec::new();
            for doc in self.query(&query)? {
                let Some(k) = doc.get(&key_field) else {
                    continue;
                };
                let mine = doc.last_updated_or_epoch(&lu_field);
                let theirs = other_dates
                    .get(&canonical_key(k))
                    .copied()
                    .unwrap_or_else(epoch);
                if mine > theirs {
                    out.push(k.clone());
                }
            }
            Ok(out)
        } else {
            let cutoff = other.last_updated()?;
            let newer = Criteria::NewerThan {
                field: self.last_updated_field().to_string(),
                after: cutoff,
            };
            let filter = criteria.clone().and(newer);
            self.distinct(self.key(), &filter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn Store`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn Store) {}
    }
}
