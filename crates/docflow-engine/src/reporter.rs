//! Build-event reporting.
//!
//! A single consumer drains the event channel and writes each event as one
//! document to an event-sink store. Writes are best-effort: failures are
//! logged and never abort the build.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use docflow_store::Store;
use docflow_types::BuildEvent;

/// Stable anonymous machine identifier, derived from host attributes and
/// cached at first use.
pub fn machine_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        user.hash(&mut hasher);
        std::env::consts::OS.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    })
}

/// Event-sink writer running as a background task.
pub struct Reporter {
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Capacity of the event channel; overflow drops events at the
    /// emitter after a warning.
    pub const CHANNEL_CAPACITY: usize = 256;

    /// Spawn the reporter over an event-sink store. Returns the sender to
    /// wire into an `EventSender` and the reporter handle to await after
    /// the last builder.
    pub fn spawn(store: Arc<dyn Store>) -> (mpsc::Sender<BuildEvent>, Self) {
        let (tx, mut rx) = mpsc::channel::<BuildEvent>(Self::CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            {
                let store = store.clone();
                let connected =
                    tokio::task::spawn_blocking(move || store.connect()).await;
                match connected {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!("reporter store failed to connect: {err}");
                    }
                    Err(join_err) => {
                        tracing::warn!("reporter connect task panicked: {join_err}");
                    }
                }
            }

            while let Some(event) = rx.recv().await {
                let store = store.clone();
                let written = tokio::task::spawn_blocking(move || {
                    let mut doc = event.to_document();
                    if !doc.contains("event_id") {
                        doc.set("event_id", json!(Uuid::new_v4().to_string()));
                    }
                    let key_fields = ["event_id".to_string()];
                    store.update(vec![doc], Some(&key_fields))
                })
                .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!("failed to write build event: {err}");
                    }
                    Err(join_err) => {
                        tracing::warn!("reporter write task panicked: {join_err}");
                    }
                }
            }
        });
        (tx, Self { handle })
    }

    /// Wait for the reporter to drain after every event sender is dropped.
    pub async fn finish(self) {
        if let Err(err) = self.handle.await {
            tracing::warn!("reporter task panicked: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_store::MemoryStore;
    use docflow_types::Criteria;

    #[test]
    fn machine_id_is_stable() {
        let a = machine_id();
        let b = machine_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn writes_one_document_per_event() {
        let store = Arc::new(MemoryStore::with_fields("events", "event_id", "at"));
        let (tx, reporter) = Reporter::spawn(store.clone());

        let build_id = Uuid::new_v4();
        tx.send(BuildEvent::started(
            "copy",
            build_id,
            "m",
            vec!["src".into()],
            vec!["dst".into()],
            Some(3),
        ))
        .await
        .unwrap();
        tx.send(BuildEvent::update("copy", build_id, "m", 3))
            .await
            .unwrap();
        tx.send(BuildEvent::ended("copy", build_id, "m", 0, 0, 0.2))
            .await
            .unwrap();
        drop(tx);
        reporter.finish().await;

        assert_eq!(store.count(&Criteria::All).unwrap(), 3);
        let started = store
            .query_one(&docflow_types::Query::new(Criteria::eq(
                "event",
                json!("started"),
            )))
            .unwrap()
            .unwrap();
        assert_eq!(started.get("builder"), Some(&json!("copy")));
    }

    #[tokio::test]
    async fn sink_failure_is_contained() {
        // Never connected and rejecting writes: the reporter logs and keeps going.
        let store = Arc::new(MemoryStore::new("events"));
        let (tx, reporter) = Reporter::spawn(store.clone());
        store.close().unwrap();
        tx.send(BuildEvent::update("copy", Uuid::new_v4(), "m", 1))
            .await
            .unwrap();
        drop(tx);
        reporter.finish().await;
    }
}
