//! Single-process concurrent executor.
//!
//! One builder runs as three concurrent stages: a producer streaming
//! `get_items`, a bounded worker pool applying `process_item`, and a
//! consumer batching results into `update_targets`. Backpressure comes
//! from two bounded queues of capacity `2 × num_workers`; a full item
//! queue suspends the producer, an empty one suspends the workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use docflow_types::BuildEvent;

use crate::builder::Builder;
use crate::errors::{BuildError, ItemFailure};
use crate::reporter::machine_id;

/// How long the consumer waits on an empty result queue before flushing a
/// partial batch.
const IDLE_FLUSH: Duration = Duration::from_millis(200);

/// Cooperative stop signal for a running build.
///
/// Stopping closes the item queue at the producer; workers finish the item
/// in hand and drain what was already queued, then the consumer flushes its
/// final partial batch.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Non-blocking emitter for build lifecycle events.
///
/// Events go through a bounded channel with `try_send`; on overflow the
/// event is dropped after a warning so the pipeline never blocks on the
/// reporter.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::Sender<BuildEvent>>,
    build_id: Uuid,
    machine: String,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// An emitter feeding the given channel.
    #[must_use]
    pub fn new(tx: mpsc::Sender<BuildEvent>, build_id: Uuid) -> Self {
        Self {
            tx: Some(tx),
            build_id,
            machine: machine_id().to_string(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An emitter that discards everything (no reporter configured).
    #[must_use]
    pub fn disabled(build_id: Uuid) -> Self {
        Self {
            tx: None,
            build_id,
            machine: machine_id().to_string(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    /// Events dropped on overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn emit(&self, event: BuildEvent) {
        let Some(tx) = &self.tx else { return };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                builder = %event.builder,
                "event channel full, dropping {:?} event",
                event.event
            );
        }
    }

    pub(crate) fn started(
        &self,
        builder: &str,
        sources: Vec<String>,
        targets: Vec<String>,
        total: Option<u64>,
    ) {
        self.emit(BuildEvent::started(
            builder,
            self.build_id,
            &self.machine,
            sources,
            targets,
            total,
        ));
    }

    pub(crate) fn update(&self, builder: &str, items: u64) {
        self.emit(BuildEvent::update(builder, self.build_id, &self.machine, items));
    }

    pub(crate) fn ended(&self, builder: &str, errors: u64, warnings: u64, duration_secs: f64) {
        self.emit(BuildEvent::ended(
            builder,
            self.build_id,
            &self.machine,
            errors,
            warnings,
            duration_secs,
        ));
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Worker tasks applying `process_item`; 1 is the degenerate serial
    /// mode.
    pub num_workers: usize,
    /// Whether to run `Builder::finalize` after the last batch. Distributed
    /// workers disable this; the manager finalizes once.
    pub finalize: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            num_workers: 1,
            finalize: true,
        }
    }
}

/// Outcome of one completed build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub builder: String,
    /// Items taken off the item queue.
    pub processed: u64,
    /// Documents acknowledged by `update_targets`.
    pub written: u64,
    /// Contained per-item failures.
    pub errors: u64,
    pub warnings: u64,
    pub duration_secs: f64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    written: AtomicU64,
    errors: AtomicU64,
}

/// Run one builder to completion on the current process.
///
/// Stores are closed on every exit path; the `Ended` event carries the
/// error and warning counts.
///
/// # Errors
///
/// Returns the first fatal error: `get_items` failures, `update_targets`
/// failures, `connect`/`finalize` failures, or internal task panics.
/// Per-item failures are contained and only counted.
pub async fn run_builder(
    builder: Arc<dyn Builder>,
    options: ExecutorOptions,
    events: &EventSender,
    stop: &StopFlag,
) -> Result<BuildReport, BuildError> {
    let start = Instant::now();
    let name = builder.name();
    let counters = Arc::new(Counters::default());
    tracing::info!(
        builder = %name,
        num_workers = options.num_workers,
        "Starting build"
    );

    let driven = drive(builder.clone(), options, events, stop, &name, &counters).await;

    let finished = match driven {
        Ok(()) if options.finalize && !stop.is_stopped() => {
            let b = builder.clone();
            tokio::task::spawn_blocking(move || b.finalize())
                .await
                .map_err(|e| anyhow::anyhow!("finalize task panicked: {e}"))?
        }
        other => other,
    };

    builder.close_stores();

    let duration_secs = start.elapsed().as_secs_f64();
    let errors = counters.errors.load(Ordering::SeqCst);
    let warnings = events.dropped();
    events.ended(&name, errors, warnings, duration_secs);

    match finished {
        Ok(()) => {
            let report = BuildReport {
                builder: name.clone(),
                processed: counters.processed.load(Ordering::SeqCst),
                written: counters.written.load(Ordering::SeqCst),
                errors,
                warnings,
                duration_secs,
            };
            tracing::info!(
                builder = %name,
                processed = report.processed,
                written = report.written,
                errors = report.errors,
                duration_secs,
                "Build completed"
            );
            Ok(report)
        }
        Err(err) => {
            tracing::error!(builder = %name, "Build failed: {err}");
            Err(err)
        }
    }
}

async fn drive(
    builder: Arc<dyn Builder>,
    options: ExecutorOptions,
    events: &EventSender,
    stop: &StopFlag,
    name: &str,
    counters: &Arc<Counters>,
) -> Result<(), BuildError> {
    {
        let b = builder.clone();
        tokio::task::spawn_blocking(move || b.connect())
            .await
            .map_err(|e| anyhow::anyhow!("connect task panicked: {e}"))??;
    }

    let items = {
        let b = builder.clone();
        tokio::task::spawn_blocking(move || b.get_items())
            .await
            .map_err(|e| anyhow::anyhow!("get_items task panicked: {e}"))??
    };

    let sources = builder.sources().iter().map(|s| s.name()).collect();
    let targets = builder.targets().iter().map(|s| s.name()).collect();
    events.started(name, sources, targets, builder.total_hint());

    let num_workers = options.num_workers.max(1);
    let queue_cap = 2 * num_workers;
    let (item_tx, item_rx) = mpsc::channel::<Value>(queue_cap);
    let (result_tx, mut result_rx) = mpsc::channel::<Value>(queue_cap);

    // Producer: single reader of get_items, suspends on a full item queue.
    let producer_stop = stop.clone();
    let producer: tokio::task::JoinHandle<Result<(), BuildError>> =
        tokio::task::spawn_blocking(move || {
            for item in items {
                if producer_stop.is_stopped() {
                    break;
                }
                let item = item?;
                if item_tx.blocking_send(item).is_err() {
                    // Downstream tore down; its error is authoritative.
                    break;
                }
            }
            Ok(())
        });

    // Worker pool: shared single receiver, one process_item in flight per
    // worker.
    let item_rx = Arc::new(tokio::sync::Mutex::new(item_rx));
    let mut workers = JoinSet::new();
    for worker_index in 0..num_workers {
        let item_rx = item_rx.clone();
        let result_tx = result_tx.clone();
        let builder = builder.clone();
        let counters = counters.clone();
        let name = name.to_string();
        workers.spawn(async move {
            loop {
                let item = { item_rx.lock().await.recv().await };
                let Some(item) = item else { break };
                counters.processed.fetch_add(1, Ordering::SeqCst);
                match process_with_deadline(&builder, item.clone()).await {
                    Ok(value) => {
                        if result_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(failure) => {
                        counters.errors.fetch_add(1, Ordering::SeqCst);
                        tracing::error!(
                            builder = %name,
                            worker = worker_index,
                            kind = ?failure.kind,
                            "process_item failed: {failure}"
                        );
                        if let Some(marked) = builder.on_item_error(&item, &failure) {
                            if result_tx.send(marked).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
    drop(result_tx);

    // Consumer: single writer into the targets, batches in completion
    // order up to chunk_size with an idle-flush threshold.
    let chunk_size = builder.chunk_size().max(1);
    let consumed: Result<(), BuildError> = async {
        let mut batch: Vec<Value> = Vec::with_capacity(chunk_size.min(4096));
        loop {
            match tokio::time::timeout(IDLE_FLUSH, result_rx.recv()).await {
                Ok(Some(value)) => {
                    batch.push(value);
                    if batch.len() >= chunk_size {
                        flush(&builder, &mut batch, events, counters, name).await?;
                    }
                }
                Ok(None) => break,
                Err(_idle) => {
                    if !batch.is_empty() {
                        flush(&builder, &mut batch, events, counters, name).await?;
                    }
                }
            }
        }
        if !batch.is_empty() {
            flush(&builder, &mut batch, events, counters, name).await?;
        }
        Ok(())
    }
    .await;
    // On a sink failure the receiver must go away so workers fail their
    // sends and unwind instead of blocking on a full result queue.
    drop(result_rx);

    // Workers drain whatever was queued, then exit.
    let mut worker_panic: Option<BuildError> = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(join_err) = joined {
            worker_panic
                .get_or_insert_with(|| anyhow::anyhow!("worker panicked: {join_err}").into());
        }
    }

    let produced = producer
        .await
        .map_err(|e| anyhow::anyhow!("producer task panicked: {e}"))?;

    produced?;
    consumed?;
    if let Some(err) = worker_panic {
        return Err(err);
    }
    Ok(())
}

/// Race `process_item` against the builder's per-item deadline.
///
/// On expiry the item is recorded as a timeout and the orphaned blocking
/// call is abandoned (cooperative cancellation; the pool thread frees up
/// when the call returns).
async fn process_with_deadline(
    builder: &Arc<dyn Builder>,
    item: Value,
) -> Result<Value, ItemFailure> {
    let b = builder.clone();
    let handle = tokio::task::spawn_blocking(move || b.process_item(item));
    let joined = match builder.item_timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, handle).await {
            Ok(joined) => joined,
            Err(_elapsed) => return Err(ItemFailure::timeout(deadline)),
        },
        None => handle.await,
    };
    match joined {
        Ok(outcome) => outcome,
        Err(join_err) => Err(ItemFailure::error(format!(
            "process_item panicked: {join_err}"
        ))),
    }
}

async fn flush(
    builder: &Arc<dyn Builder>,
    batch: &mut Vec<Value>,
    events: &EventSender,
    counters: &Arc<Counters>,
    name: &str,
) -> Result<(), BuildError> {
    let items = std::mem::take(batch);
    let count = items.len() as u64;
    tracing::debug!(builder = %name, items = count, "Writing batch");

    let b = builder.clone();
    let (result, items) = tokio::task::spawn_blocking(move || {
        let result = b.update_targets(&items);
        (result, items)
    })
    .await
    .map_err(|e| anyhow::anyhow!("update_targets task panicked: {e}"))?;

    match result {
        Ok(()) => {
            counters.written.fetch_add(count, Ordering::SeqCst);
            events.update(name, count);
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                builder = %name,
                batch = %serde_json::to_string(&items).unwrap_or_default(),
                "update_targets failed: {err}"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_latches() {
        let flag = StopFlag::new();
        assert!(!flag.is_stopped());
        flag.stop();
        assert!(flag.is_stopped());
        assert!(flag.clone().is_stopped());
    }

    #[test]
    fn disabled_sender_never_drops() {
        let events = EventSender::disabled(Uuid::new_v4());
        events.started("b", vec![], vec![], None);
        events.update("b", 3);
        events.ended("b", 0, 0, 0.1);
        assert_eq!(events.dropped(), 0);
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let events = EventSender::new(tx, Uuid::new_v4());
        events.update("b", 1);
        events.update("b", 2);
        assert_eq!(events.dropped(), 1);
    }

    #[test]
    fn default_options_are_serial() {
        let opts = ExecutorOptions::default();
        assert_eq!(opts.num_workers, 1);
        assert!(opts.finalize);
    }
}
