pub mod build;
pub mod monitor;
pub mod queue;

pub use build::{Build, BuildOutcome, BuildStatus, Platform, Worker, WorkerStatus};
pub use monitor::HeartbeatMonitor;
pub use queue::JobQueue;
