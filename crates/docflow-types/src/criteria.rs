//! Query criteria evaluated by store adapters.
//!
//! [`Criteria`] is a small composable matcher; reference adapters evaluate
//! it in-process, remote adapters are free to translate it into their
//! native query language.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// A composable document filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Criteria {
    /// Matches every document.
    All,
    /// Field equals the given value.
    Eq { field: String, value: Value },
    /// Field equals one of the given values.
    In { field: String, values: Vec<Value> },
    /// Field parses as a timestamp strictly after `after`.
    NewerThan { field: String, after: DateTime<Utc> },
    /// Field is present.
    Exists { field: String },
    /// Every clause matches.
    And { clauses: Vec<Criteria> },
    /// At least one clause matches.
    Or { clauses: Vec<Criteria> },
    /// The clause does not match.
    Not { clause: Box<Criteria> },
}

impl Criteria {
    /// Shorthand for an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            field: field.into(),
            value,
        }
    }

    /// Shorthand for a membership filter.
    pub fn key_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    /// Conjunction that collapses `All` operands away.
    #[must_use]
    pub fn and(self, other: Criteria) -> Self {
        match (self, other) {
            (Self::All, c) | (c, Self::All) => c,
            (Self::And { mut clauses }, c) => {
                clauses.push(c);
                Self::And { clauses }
            }
            (a, b) => Self::And { clauses: vec![a, b] },
        }
    }

    /// Evaluate the filter against one document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq { field, value } => doc.get(field) == Some(value),
            Self::In { field, values } => {
                doc.get(field).is_some_and(|v| values.contains(v))
            }
            Self::NewerThan { field, after } => {
                doc.timestamp(field).is_some_and(|ts| ts > *after)
            }
            Self::Exists { field } => doc.contains(field),
            Self::And { clauses } => clauses.iter().all(|c| c.matches(doc)),
            Self::Or { clauses } => clauses.iter().any(|c| c.matches(doc)),
            Self::Not { clause } => !clause.matches(doc),
        }
    }
}

impl Default for Criteria {
    fn default() -> Self {
        Self::All
    }
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A single-field sort order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// A full store query: criteria plus projection, sort, and paging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub criteria: Criteria,
    /// Fields to return; `None` returns whole documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    /// Query matching `criteria`, returning whole documents.
    #[must_use]
    pub fn new(criteria: Criteria) -> Self {
        Self {
            criteria,
            ..Self::default()
        }
    }

    /// Query matching everything.
    #[must_use]
    pub fn all() -> Self {
        Self::new(Criteria::All)
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = Some(properties);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn eq_and_in_match() {
        let d = doc(json!({"name": "a", "v": 1}));
        assert!(Criteria::eq("name", json!("a")).matches(&d));
        assert!(!Criteria::eq("name", json!("b")).matches(&d));
        assert!(Criteria::key_in("v", vec![json!(1), json!(2)]).matches(&d));
        assert!(!Criteria::key_in("v", vec![json!(3)]).matches(&d));
    }

    #[test]
    fn newer_than_compares_timestamps() {
        let d = doc(json!({"last_updated": "2026-02-01T00:00:00Z"}));
        let jan: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let mar: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let c = |after: DateTime<Utc>| Criteria::NewerThan {
            field: "last_updated".into(),
            after,
        };
        assert!(c(jan).matches(&d));
        assert!(!c(mar).matches(&d));
    }

    #[test]
    fn newer_than_rejects_missing_field() {
        let d = doc(json!({"name": "a"}));
        let c = Criteria::NewerThan {
            field: "last_updated".into(),
            after: "2026-01-01T00:00:00Z".parse().unwrap(),
        };
        assert!(!c.matches(&d));
    }

    #[test]
    fn and_collapses_all() {
        let c = Criteria::All.and(Criteria::eq("name", json!("a")));
        assert_eq!(c, Criteria::eq("name", json!("a")));
        let c = Criteria::eq("name", json!("a")).and(Criteria::All);
        assert_eq!(c, Criteria::eq("name", json!("a")));
    }

    #[test]
    fn boolean_composition() {
        let d = doc(json!({"state": "failed", "v": 1}));
        let failed = Criteria::eq("state", json!("failed"));
        let v2 = Criteria::eq("v", json!(2));
        assert!(Criteria::Or {
            clauses: vec![failed.clone(), v2.clone()]
        }
        .matches(&d));
        assert!(!Criteria::And {
            clauses: vec![failed.clone(), v2]
        }
        .matches(&d));
        assert!(!Criteria::Not {
            clause: Box::new(failed)
        }
        .matches(&d));
    }

    #[test]
    fn criteria_serde_roundtrip() {
        let c = Criteria::And {
            clauses: vec![
                Criteria::eq("state", json!("failed")),
                Criteria::key_in("name", vec![json!("a"), json!("b")]),
            ],
        };
        let s = serde_json::to_string(&c).unwrap();
        assert!(s.contains("\"op\""));
        let back: Criteria = serde_json::from_str(&s).unwrap();
        assert_eq!(c, back);
    }
}
