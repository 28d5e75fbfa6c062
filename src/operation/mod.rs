//! Per-operation lifecycle tracking.

mod batch;
mod snapshot;
mod tracker;

pub use batch::BatchTracker;
pub use snapshot::{OperationSnapshot, OperationState};
pub use tracker::{OperationTracker, TrackerConfig, DEFAULT_TICK_INTERVAL, DEFAULT_TIMEOUT};
