//! Build-engine crate: the Builder contract, the single-process executor,
//! the template builders, the distributed coordinator, the reporter, and
//! the runner.

pub mod builder;
pub mod distributed;
pub mod errors;
pub mod executor;
pub mod group_builder;
pub mod map_builder;
pub mod registry;
pub mod reporter;
pub mod runner;

pub use builder::{Builder, ItemStream, DEFAULT_CHUNK_SIZE};
pub use errors::{BuildError, ItemFailure, ItemFailureKind};
pub use executor::{run_builder, BuildReport, EventSender, ExecutorOptions, StopFlag};
pub use map_builder::{MapBuilder, MapOptions};
pub use group_builder::{GroupBuilder, GroupOptions};
pub use registry::BuilderRegistry;
pub use reporter::{machine_id, Reporter};
pub use runner::{Runner, RunSummary};
