//! Distributed build coordination: one manager dispatches prechunked work
//! over a control bus to workers that each run the single-process executor.

pub mod bus;
pub mod manager;
pub mod worker;

pub use bus::{
    high_water_mark, LocalBroker, ManagerBus, TcpManagerBus, TcpWorkerBus, WorkerBus,
};
pub use manager::{manage_builder, ManagerOptions};
pub use worker::{run_worker, WorkerOptions};
