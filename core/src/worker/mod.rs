//! Non-real-time background threads that drain the sample bus.
//!
//! A [`BackgroundWorker`] owns one thread, one bus consumer and one
//! [`WorkerTask`]. The [`WorkerManager`] keeps every worker on the same
//! stream configuration and rebuilds tasks that panic.

pub mod manager;
pub mod shaper;
#[allow(clippy::module_inception)]
pub mod worker;

use thiserror::Error;

pub use manager::{WorkerId, WorkerManager};
pub use shaper::{BeamShaper, PointSink};
pub use worker::{BackgroundWorker, StreamConfig, TaskFactory, WorkerState, WorkerStats, WorkerTask};

/// Errors raised while managing workers.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
