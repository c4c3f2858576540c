//! Distributed build manager.
//!
//! Splits a builder's work via `prechunk`, dispatches chunks to workers on
//! `READY`, tracks heartbeats, re-queues chunks of silent workers, and
//! finalizes the builder locally once every chunk is terminal. Chunks are
//! independent and commutative: `update_targets` idempotence makes
//! re-queueing after a presumed-dead worker safe even if that worker later
//! completes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use docflow_types::{BusMessage, ChunkSpec};

use crate::builder::Builder;
use crate::distributed::bus::ManagerBus;
use crate::errors::BuildError;
use crate::executor::{EventSender, StopFlag};
use crate::registry::apply_chunk;

/// Manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Chunks requested from `prechunk`.
    pub num_chunks: usize,
    /// Heartbeat silence after which an in-flight worker's chunk is
    /// re-queued; unbounded when `None`.
    pub worker_timeout: Option<Duration>,
    /// How often heartbeat deadlines are swept.
    pub poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            num_chunks: 1,
            worker_timeout: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkStatus {
    Pending,
    Dispatched { endpoint: String },
    Done,
}

struct WorkerState {
    worker_id: String,
    last_seen: Instant,
    chunk: Option<usize>,
}

struct Dispatcher<'a> {
    description: &'a Value,
    chunks: &'a [ChunkSpec],
    status: Vec<ChunkStatus>,
    workers: HashMap<String, WorkerState>,
    /// Workers whose `READY` arrived while every remaining chunk was in
    /// flight elsewhere; served first when a chunk is re-queued.
    parked: VecDeque<String>,
}

impl Dispatcher<'_> {
    fn all_done(&self) -> bool {
        self.status.iter().all(|s| *s == ChunkStatus::Done)
    }

    fn next_pending(&self) -> Option<usize> {
        self.status.iter().position(|s| *s == ChunkStatus::Pending)
    }

    async fn dispatch(
        &mut self,
        bus: &mut dyn ManagerBus,
        index: usize,
        endpoint: &str,
    ) -> Result<(), BuildError> {
        let overridden = apply_chunk(self.description, &self.chunks[index])?;
        bus.send(
            endpoint,
            BusMessage::Chunk {
                index,
                total: self.chunks.len(),
                builder: overridden,
            },
        )
        .await?;
        self.status[index] = ChunkStatus::Dispatched {
            endpoint: endpoint.to_string(),
        };
        if let Some(state) = self.workers.get_mut(endpoint) {
            state.chunk = Some(index);
        }
        tracing::debug!(chunk = index, %endpoint, "chunk dispatched");
        Ok(())
    }

    async fn release_parked(&mut self, bus: &mut dyn ManagerBus) -> Result<(), BuildError> {
        while let Some(endpoint) = self.parked.pop_front() {
            tracing::debug!(%endpoint, "releasing parked worker");
            bus.send(&endpoint, BusMessage::Exit).await?;
            self.workers.remove(&endpoint);
        }
        Ok(())
    }

    /// Re-queue chunks of workers that stopped heartbeating. Parked and
    /// between-chunk workers carry no heartbeat and are left alone.
    async fn sweep_dead_workers(
        &mut self,
        bus: &mut dyn ManagerBus,
        deadline: Duration,
    ) -> Result<(), BuildError> {
        let now = Instant::now();
        let silent: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.chunk.is_some() && now.duration_since(w.last_seen) > deadline)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        for endpoint in silent {
            let Some(state) = self.workers.remove(&endpoint) else {
                continue;
            };
            let Some(index) = state.chunk else { continue };
            tracing::warn!(
                worker = %state.worker_id,
                chunk = index,
                "worker stopped heartbeating; re-queueing chunk"
            );
            self.status[index] = ChunkStatus::Pending;
            if let Some(idle) = self.parked.pop_front() {
                self.dispatch(bus, index, &idle).await?;
            }
        }
        Ok(())
    }
}

/// Distribute one builder's work across the workers on `bus`.
///
/// The builder instance is used for `prechunk` and the final `finalize`;
/// each worker rehydrates its own instance from `description` with the
/// chunk's overrides applied.
///
/// # Errors
///
/// Returns [`BuildError`] on prechunk failure (other than a missing
/// `prechunk`, which falls back to a single whole-work chunk), bus
/// transport death, or a `FAILED` chunk report.
pub async fn manage_builder(
    bus: &mut dyn ManagerBus,
    description: &Value,
    builder: Arc<dyn Builder>,
    options: &ManagerOptions,
    events: &EventSender,
    stop: &StopFlag,
) -> Result<(), BuildError> {
    let start = Instant::now();
    let name = builder.name();

    {
        let b = builder.clone();
        tokio::task::spawn_blocking(move || b.connect())
            .await
            .map_err(|e| anyhow::anyhow!("connect task panicked: {e}"))??;
    }

    let chunks = {
        let b = builder.clone();
        let num_chunks = options.num_chunks.max(1);
        let prechunked = tokio::task::spawn_blocking(move || b.prechunk(num_chunks))
            .await
            .map_err(|e| anyhow::anyhow!("prechunk task panicked: {e}"))?;
        match prechunked {
            Ok(chunks) => chunks,
            Err(BuildError::NotDistributable { .. }) => {
                tracing::warn!(
                    builder = %name,
                    "builder has no prechunk; running as a single chunk"
                );
                vec![ChunkSpec::empty()]
            }
            Err(err) => {
                builder.close_stores();
                return Err(err);
            }
        }
    };
    tracing::info!(builder = %name, chunks = chunks.len(), "Distributing chunks to workers");

    let mut dispatcher = Dispatcher {
        description,
        chunks: &chunks,
        status: vec![ChunkStatus::Pending; chunks.len()],
        workers: HashMap::new(),
        parked: VecDeque::new(),
    };
    let mut ticker = tokio::time::interval(options.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let outcome: Result<(), BuildError> = loop {
        if dispatcher.all_done() {
            break Ok(());
        }
        if stop.is_stopped() {
            break Err(BuildError::Other(anyhow::anyhow!(
                "distributed build cancelled"
            )));
        }

        let step: Result<(), BuildError> = tokio::select! {
            received = bus.recv() => {
                match received {
                    Ok((endpoint, message)) => {
                        handle_message(bus, &mut dispatcher, endpoint, message).await
                    }
                    Err(err) => Err(err),
                }
            }
            _ = ticker.tick() => {
                match options.worker_timeout {
                    Some(deadline) => dispatcher.sweep_dead_workers(bus, deadline).await,
                    None => Ok(()),
                }
            }
        };
        if let Err(err) = step {
            break Err(err);
        }
    };

    // Release anything still connected, on success and failure alike.
    if let Err(err) = dispatcher.release_parked(bus).await {
        tracing::warn!("failed to release parked workers: {err}");
    }
    if let Err(err) = bus.broadcast(BusMessage::Exit).await {
        tracing::warn!("exit broadcast failed: {err}");
    }

    let finished = match outcome {
        Ok(()) => {
            let b = builder.clone();
            tokio::task::spawn_blocking(move || b.finalize())
                .await
                .map_err(|e| anyhow::anyhow!("finalize task panicked: {e}"))?
        }
        Err(err) => Err(err),
    };

    builder.close_stores();
    events.ended(&name, 0, 0, start.elapsed().as_secs_f64());

    match &finished {
        Ok(()) => tracing::info!(
            builder = %name,
            chunks = chunks.len(),
            duration_secs = start.elapsed().as_secs_f64(),
            "Distributed build completed"
        ),
        Err(err) => tracing::error!(builder = %name, "Distributed build failed: {err}"),
    }
    finished
}

async fn handle_message(
    bus: &mut dyn ManagerBus,
    dispatcher: &mut Dispatcher<'_>,
    endpoint: String,
    message: BusMessage,
) -> Result<(), BuildError> {
    match message {
        BusMessage::Ready {
            worker_id,
            num_workers,
        } => {
            let state = dispatcher
                .workers
                .entry(endpoint.clone())
                .or_insert_with(|| {
                    tracing::info!(worker = %worker_id, num_workers, "worker connected");
                    WorkerState {
                        worker_id: worker_id.clone(),
                        last_seen: Instant::now(),
                        chunk: None,
                    }
                });
            state.last_seen = Instant::now();
            let abandoned = state.chunk.take();

            // A READY while this worker's chunk is still marked in flight
            // means the worker abandoned it (bus hiccup mid-chunk); put the
            // chunk back in the queue.
            if let Some(index) = abandoned {
                if matches!(
                    dispatcher.status.get(index),
                    Some(ChunkStatus::Dispatched { endpoint: e }) if *e == endpoint
                ) {
                    tracing::warn!(chunk = index, "worker re-announced; re-queueing its chunk");
                    dispatcher.status[index] = ChunkStatus::Pending;
                }
            }

            if let Some(index) = dispatcher.next_pending() {
                dispatcher.dispatch(bus, index, &endpoint).await?;
            } else if dispatcher.all_done() {
                tracing::debug!(worker = %worker_id, "all chunks done; releasing worker");
                bus.send(&endpoint, BusMessage::Exit).await?;
                dispatcher.workers.remove(&endpoint);
            } else {
                // Everything is in flight elsewhere; hold the reply so a
                // re-queued chunk can go to this worker.
                tracing::debug!(worker = %worker_id, "no pending chunks; parking worker");
                dispatcher.parked.push_back(endpoint);
            }
        }
        BusMessage::Heartbeat { worker_id } => {
            if let Some(state) = dispatcher.workers.get_mut(&endpoint) {
                state.last_seen = Instant::now();
            } else {
                tracing::debug!(worker = %worker_id, "heartbeat from unknown worker");
            }
        }
        BusMessage::Done { worker_id, index } => {
            if let Some(slot) = dispatcher.status.get_mut(index) {
                *slot = ChunkStatus::Done;
                tracing::info!(chunk = index, worker = %worker_id, "chunk completed");
            } else {
                tracing::warn!(chunk = index, "DONE for unknown chunk index");
            }
            if let Some(state) = dispatcher.workers.get_mut(&endpoint) {
                state.chunk = None;
                state.last_seen = Instant::now();
            }
            if dispatcher.all_done() {
                dispatcher.release_parked(bus).await?;
            }
        }
        BusMessage::Failed {
            worker_id,
            index,
            error,
        } => {
            return Err(BuildError::Other(anyhow::anyhow!(
                "worker '{worker_id}' failed chunk {index}: {error}"
            )));
        }
        BusMessage::Chunk { .. } | BusMessage::Exit => {
            tracing::warn!(%endpoint, "unexpected message from worker");
        }
    }
    Ok(())
}
