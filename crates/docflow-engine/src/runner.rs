//! Top-level driver.
//!
//! Orders builders and runs them sequentially (two builders never overlap
//! target writes), wires the reporter when configured, and propagates the
//! first fatal error. The `build_id` is fixed for the whole run.

use std::sync::Arc;

use uuid::Uuid;

use docflow_store::Store;

use crate::builder::Builder;
use crate::errors::BuildError;
use crate::executor::{run_builder, BuildReport, EventSender, ExecutorOptions, StopFlag};
use crate::reporter::Reporter;

/// Outcome of a full run across builders.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<BuildReport>,
}

/// Sequential builder driver for single-process mode.
pub struct Runner {
    num_workers: usize,
    reporter_store: Option<Arc<dyn Store>>,
}

impl Runner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_workers: 1,
            reporter_store: None,
        }
    }

    /// Worker tasks per builder (default 1).
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Install an event-sink store for build events.
    #[must_use]
    pub fn with_reporter(mut self, store: Arc<dyn Store>) -> Self {
        self.reporter_store = Some(store);
        self
    }

    /// Run the builders in order, stopping at the first fatal error:
    /// failure of one builder does not run subsequent ones.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`BuildError`].
    pub async fn run(
        &self,
        builders: Vec<Arc<dyn Builder>>,
        stop: &StopFlag,
    ) -> Result<RunSummary, BuildError> {
        let build_id = Uuid::new_v4();
        let (events, reporter) = match &self.reporter_store {
            Some(store) => {
                let (tx, reporter) = Reporter::spawn(store.clone());
                (EventSender::new(tx, build_id), Some(reporter))
            }
            None => (EventSender::disabled(build_id), None),
        };

        let options = ExecutorOptions {
            num_workers: self.num_workers,
            finalize: true,
        };

        let mut summary = RunSummary::default();
        let mut failure: Option<BuildError> = None;
        for builder in builders {
            if stop.is_stopped() {
                tracing::info!("run cancelled; skipping remaining builders");
                break;
            }
            match run_builder(builder, options, &events, stop).await {
                Ok(report) => summary.reports.push(report),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        drop(events);
        if let Some(reporter) = reporter {
            reporter.finish().await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}
