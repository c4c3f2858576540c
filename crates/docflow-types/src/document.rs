//! Self-describing document model.
//!
//! A [`Document`] is a nested map with string keys. One field is designated
//! the key (unique within a store) and one the last-updated timestamp;
//! which fields those are is decided by the store holding the document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The underlying field map of a document.
pub type FieldMap = serde_json::Map<String, Value>;

/// The sentinel timestamp for documents with no last-updated field.
///
/// A document without a timestamp is treated as older than any
/// timestamped document.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// A self-describing document: a nested map with string keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(FieldMap);

impl Document {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self(FieldMap::new())
    }

    /// Wrap a JSON value, if it is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Consume the document, returning it as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrow a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Whether the document carries a field.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over (field, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrow the underlying field map.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    /// Keep only the named fields, dropping everything else.
    pub fn project(&self, fields: &[String]) -> Self {
        let mut out = FieldMap::new();
        for f in fields {
            if let Some(v) = self.0.get(f) {
                out.insert(f.clone(), v.clone());
            }
        }
        Self(out)
    }

    /// Parse the named field as an RFC-3339 timestamp.
    ///
    /// Returns `None` when the field is absent or not a parseable
    /// timestamp string.
    #[must_use]
    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.0.get(field)? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            _ => None,
        }
    }

    /// The last-updated timestamp, or the epoch sentinel when missing.
    #[must_use]
    pub fn last_updated_or_epoch(&self, field: &str) -> DateTime<Utc> {
        self.timestamp(field).unwrap_or_else(epoch)
    }
}

impl From<FieldMap> for Document {
    fn from(map: FieldMap) -> Self {
        Self(map)
    }
}

/// Canonical string encoding of a key value, used to index documents.
///
/// Two key values compare equal iff their canonical encodings do.
#[must_use]
pub fn canonical_key(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Document::from_value(json!([1, 2])).is_none());
        assert!(Document::from_value(json!("scalar")).is_none());
        assert!(Document::from_value(json!({"a": 1})).is_some());
    }

    #[test]
    fn get_set_remove() {
        let mut d = doc(json!({"name": "a"}));
        assert_eq!(d.get("name"), Some(&json!("a")));
        d.set("v", json!(2));
        assert_eq!(d.get("v"), Some(&json!(2)));
        assert_eq!(d.remove("v"), Some(json!(2)));
        assert!(!d.contains("v"));
    }

    #[test]
    fn project_keeps_only_named_fields() {
        let d = doc(json!({"name": "a", "v": 1, "extra": true}));
        let p = d.project(&["name".into(), "v".into(), "missing".into()]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.get("name"), Some(&json!("a")));
        assert!(p.get("extra").is_none());
    }

    #[test]
    fn timestamp_parses_rfc3339() {
        let d = doc(json!({"last_updated": "2026-01-15T10:00:00Z"}));
        let ts = d.timestamp("last_updated").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-15T10:00:00+00:00");
    }

    #[test]
    fn missing_timestamp_is_epoch() {
        let d = doc(json!({"name": "a"}));
        assert_eq!(d.last_updated_or_epoch("last_updated"), epoch());
    }

    #[test]
    fn non_string_timestamp_is_epoch() {
        let d = doc(json!({"last_updated": 12345}));
        assert_eq!(d.last_updated_or_epoch("last_updated"), epoch());
    }

    #[test]
    fn serde_is_transparent() {
        let d = doc(json!({"name": "a", "v": 1}));
        let s = serde_json::to_string(&d).unwrap();
        let back: Document = serde_json::from_str(&s).unwrap();
        assert_eq!(d, back);
        assert!(s.starts_with('{'));
    }

    #[test]
    fn canonical_keys_distinguish_types() {
        assert_ne!(canonical_key(&json!("1")), canonical_key(&json!(1)));
        assert_eq!(canonical_key(&json!("a")), canonical_key(&json!("a")));
    }
}
