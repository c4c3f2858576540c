mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use uuid::Uuid;

use docflow_engine::distributed::{
    high_water_mark, manage_builder, run_worker, ManagerOptions, TcpManagerBus, TcpWorkerBus,
    WorkerOptions,
};
use docflow_engine::registry::load_descriptions;
use docflow_engine::reporter::Reporter;
use docflow_engine::{BuilderRegistry, EventSender, Runner, StopFlag};
use docflow_store::Store;

#[derive(Parser)]
#[command(name = "docflow", version, about = "Document ETL build engine")]
struct Cli {
    /// Builder description files (YAML or JSON)
    #[arg(required = true)]
    builders: Vec<PathBuf>,

    /// Number of worker tasks in single-process mode (and inside each
    /// distributed worker)
    #[arg(short = 'n', long, default_value_t = 1)]
    num_workers: usize,

    /// Controls logging level per number of v's (warn / info / debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Serialized event-sink store to send reporting data to
    #[arg(short = 'r', long = "reporter")]
    reporter: Option<PathBuf>,

    /// Control-bus URL; manager mode when --num-chunks > 0, worker mode
    /// otherwise
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Number of chunks to distribute to workers
    #[arg(short = 'N', long, default_value_t = 0)]
    num_chunks: usize,

    /// Seconds of heartbeat silence before a worker's chunk is re-queued
    #[arg(long)]
    worker_timeout: Option<u64>,
}

fn reporter_store(
    registry: &BuilderRegistry,
    path: Option<&PathBuf>,
) -> anyhow::Result<Option<Arc<dyn Store>>> {
    let Some(path) = path else { return Ok(None) };
    let specs = load_descriptions(path)?;
    let spec = specs
        .first()
        .with_context(|| format!("empty reporter store description: {}", path.display()))?;
    Ok(Some(registry.stores().from_value(spec)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbosity);

    let registry = BuilderRegistry::with_defaults();
    let mut descriptions = Vec::new();
    for path in &cli.builders {
        descriptions.extend(load_descriptions(path)?);
    }
    let reporter_store = reporter_store(&registry, cli.reporter.as_ref())?;

    match (&cli.url, cli.num_chunks) {
        (Some(url), num_chunks) if num_chunks > 0 => {
            // Manager mode.
            let build_id = Uuid::new_v4();
            let (events, reporter) = match reporter_store {
                Some(store) => {
                    let (tx, reporter) = Reporter::spawn(store);
                    (EventSender::new(tx, build_id), Some(reporter))
                }
                None => (EventSender::disabled(build_id), None),
            };

            let hwm = high_water_mark(num_chunks, cli.num_workers);
            let mut bus = TcpManagerBus::bind(url, hwm).await?;
            tracing::info!(addr = %bus.local_addr(), "manager control endpoint bound");

            let stop = StopFlag::new();
            let ctrl_c_stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, releasing workers");
                    ctrl_c_stop.stop();
                }
            });

            let options = ManagerOptions {
                num_chunks,
                worker_timeout: cli.worker_timeout.map(Duration::from_secs),
                ..ManagerOptions::default()
            };
            let mut failure = None;
            for description in &descriptions {
                let builder = registry.from_value(description)?;
                if let Err(err) =
                    manage_builder(&mut bus, description, builder, &options, &events, &stop).await
                {
                    failure = Some(err);
                    break;
                }
            }

            drop(events);
            if let Some(reporter) = reporter {
                reporter.finish().await;
            }
            if let Some(err) = failure {
                return Err(err.into());
            }
        }
        (Some(url), _) => {
            // Worker mode.
            let build_id = Uuid::new_v4();
            let (events, reporter) = match reporter_store {
                Some(store) => {
                    let (tx, reporter) = Reporter::spawn(store);
                    (EventSender::new(tx, build_id), Some(reporter))
                }
                None => (EventSender::disabled(build_id), None),
            };

            let id = Uuid::new_v4().simple().to_string();
            let worker_id = &id[..8];
            let mut bus = TcpWorkerBus::connect(url).await?;
            let options = WorkerOptions {
                num_workers: cli.num_workers,
                ..WorkerOptions::default()
            };
            let outcome = run_worker(&mut bus, &registry, &options, &events, worker_id).await;

            drop(events);
            if let Some(reporter) = reporter {
                reporter.finish().await;
            }
            outcome?;
        }
        (None, _) => {
            // Single-process mode.
            let builders = descriptions
                .iter()
                .map(|d| registry.from_value(d))
                .collect::<Result<Vec<_>, _>>()?;

            let stop = StopFlag::new();
            let ctrl_c_stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, finishing in-flight work");
                    ctrl_c_stop.stop();
                }
            });

            let mut runner = Runner::new().with_num_workers(cli.num_workers);
            if let Some(store) = reporter_store {
                runner = runner.with_reporter(store);
            }
            runner.run(builders, &stop).await?;
        }
    }

    Ok(())
}
