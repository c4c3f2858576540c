//! Build lifecycle events.
//!
//! One build run emits `Started`, zero or more `Update`s, and one `Ended`,
//! in that order. Events are plain documents so any store can act as an
//! event sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Update,
    Ended,
}

/// Per-kind event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Started {
        sources: Vec<String>,
        targets: Vec<String>,
        total: Option<u64>,
    },
    Update {
        items: u64,
    },
    Ended {
        errors: u64,
        warnings: u64,
        duration_secs: f64,
    },
}

/// A single build lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub event: EventKind,
    pub builder: String,
    pub build_id: Uuid,
    pub machine_id: String,
    pub at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl BuildEvent {
    pub fn started(
        builder: impl Into<String>,
        build_id: Uuid,
        machine_id: impl Into<String>,
        sources: Vec<String>,
        targets: Vec<String>,
        total: Option<u64>,
    ) -> Self {
        Self {
            event: EventKind::Started,
            builder: builder.into(),
            build_id,
            machine_id: machine_id.into(),
            at: Utc::now(),
            payload: EventPayload::Started {
                sources,
                targets,
                total,
            },
        }
    }

    pub fn update(
        builder: impl Into<String>,
        build_id: Uuid,
        machine_id: impl Into<String>,
        items: u64,
    ) -> Self {
        Self {
            event: EventKind::Update,
            builder: builder.into(),
            build_id,
            machine_id: machine_id.into(),
            at: Utc::now(),
            payload: EventPayload::Update { items },
        }
    }

    pub fn ended(
        builder: impl Into<String>,
        build_id: Uuid,
        machine_id: impl Into<String>,
        errors: u64,
        warnings: u64,
        duration_secs: f64,
    ) -> Self {
        Self {
            event: EventKind::Ended,
            builder: builder.into(),
            build_id,
            machine_id: machine_id.into(),
            at: Utc::now(),
            payload: EventPayload::Ended {
                errors,
                warnings,
                duration_secs,
            },
        }
    }

    /// Render the event as a store document.
    ///
    /// The layout is stable: `{event, builder, build_id, machine_id, at,
    /// payload}`, with `at` as an RFC-3339 string.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let value = serde_json::json!({
            "event": self.event,
            "builder": self.builder,
            "build_id": self.build_id.to_string(),
            "machine_id": self.machine_id,
            "at": self.at.to_rfc3339(),
            "payload": self.payload,
        });
        Document::from_value(value).unwrap_or_default()
    }
}
