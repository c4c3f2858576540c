//! Distributed build worker.
//!
//! Loops `READY` then `CHUNK` or `EXIT`; on a chunk it rehydrates the
//! builder from the overridden description, runs the single-process
//! executor while heartbeating at a fixed interval, and reports `DONE` or
//! `FAILED`. Bus failures abort the current chunk and re-enter the ready
//! loop under a retry budget.

use std::time::Duration;

use docflow_types::BusMessage;

use crate::distributed::bus::WorkerBus;
use crate::errors::BuildError;
use crate::executor::{run_builder, EventSender, ExecutorOptions, StopFlag};
use crate::registry::BuilderRegistry;

/// Worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Worker tasks inside this worker's executor.
    pub num_workers: usize,
    /// Interval between heartbeats while a chunk runs.
    pub heartbeat_interval: Duration,
    /// Silence after which the manager is presumed dead.
    pub manager_timeout: Duration,
    /// Bus failures tolerated before the worker gives up.
    pub retry_budget: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            num_workers: 1,
            heartbeat_interval: Duration::from_secs(5),
            manager_timeout: Duration::from_secs(60),
            retry_budget: 3,
        }
    }
}

/// Pull and run chunks until the manager sends `EXIT`.
///
/// # Errors
///
/// Returns [`BuildError::Bus`] when the manager times out, the transport
/// dies, or the bus retry budget is exhausted. Chunk-level builder errors
/// are reported back as `FAILED` and do not end the loop; the manager
/// decides whether to continue.
pub async fn run_worker(
    bus: &mut dyn WorkerBus,
    registry: &BuilderRegistry,
    options: &WorkerOptions,
    events: &EventSender,
    worker_id: &str,
) -> Result<(), BuildError> {
    let mut bus_failures: u32 = 0;
    tracing::info!(worker = %worker_id, "worker starting");

    loop {
        bus.send(BusMessage::Ready {
            worker_id: worker_id.to_string(),
            num_workers: options.num_workers,
        })
        .await?;

        let message = match tokio::time::timeout(options.manager_timeout, bus.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                return Err(BuildError::bus("stopping work as manager timed out"));
            }
        };

        match message {
            BusMessage::Exit => {
                tracing::info!(worker = %worker_id, "released by manager");
                return Ok(());
            }
            BusMessage::Chunk {
                index,
                total,
                builder: description,
            } => {
                tracing::info!(worker = %worker_id, chunk = index, total, "received chunk");
                let builder = match registry.from_value(&description) {
                    Ok(builder) => builder,
                    Err(err) => {
                        tracing::error!(chunk = index, "failed to rehydrate builder: {err}");
                        bus.send(BusMessage::Failed {
                            worker_id: worker_id.to_string(),
                            index,
                            error: err.to_string(),
                        })
                        .await?;
                        continue;
                    }
                };

                let stop = StopFlag::new();
                let exec_options = ExecutorOptions {
                    num_workers: options.num_workers,
                    // The manager finalizes exactly once after all chunks.
                    finalize: false,
                };
                let run = run_builder(builder, exec_options, events, &stop);
                tokio::pin!(run);

                let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
                heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                let outcome = loop {
                    tokio::select! {
                        result = &mut run => break result,
                        _ = heartbeat.tick() => {
                            if let Err(err) = bus
                                .send(BusMessage::Heartbeat {
                                    worker_id: worker_id.to_string(),
                                })
                                .await
                            {
                                tracing::warn!(
                                    chunk = index,
                                    "heartbeat failed, aborting chunk: {err}"
                                );
                                stop.stop();
                                let _ = (&mut run).await;
                                break Err(BuildError::bus(format!("heartbeat failed: {err}")));
                            }
                        }
                    }
                };

                match outcome {
                    Ok(report) => {
                        tracing::info!(
                            worker = %worker_id,
                            chunk = index,
                            written = report.written,
                            errors = report.errors,
                            "chunk completed"
                        );
                        bus.send(BusMessage::Done {
                            worker_id: worker_id.to_string(),
                            index,
                        })
                        .await?;
                    }
                    Err(err @ BuildError::Bus(_)) => {
                        bus_failures += 1;
                        if bus_failures > options.retry_budget {
                            tracing::error!("bus retry budget exhausted");
                            return Err(err);
                        }
                        tracing::warn!(
                            chunk = index,
                            attempt = bus_failures,
                            "bus failure, re-entering ready loop: {err}"
                        );
                    }
                    Err(err) => {
                        tracing::error!(worker = %worker_id, chunk = index, "chunk failed: {err}");
                        bus.send(BusMessage::Failed {
                            worker_id: worker_id.to_string(),
                            index,
                            error: err.to_string(),
                        })
                        .await?;
                    }
                }
            }
            other => {
                tracing::warn!(worker = %worker_id, "unexpected message: {other:?}");
            }
        }
    }
}
