//! Transit Core
//!
//! Wires the broker, decoder, tracker and ingestion crates into runnable pipelines:
//! a listener loop driven by a `DeliveryHandler`, the completion poller, the run
//! configuration and the end-to-end transfer test.

pub mod config;
pub mod context;
pub mod control;
pub mod handler;
pub mod listener;
pub mod orchestrator;
pub mod poller;

pub use config::{BrokerConfig, Config, ConfigError, IngestConfig, TrackerConfig, TransferConfig};
pub use context::{RunContext, ShutdownSignal};
pub use control::{ControlPlane, ControlPlaneError, RucioCli, UploadItem};
pub use handler::{CorrelationHandler, CorrelationStats, DeliveryHandler, IngestHandler};
pub use listener::{Listener, ListenerStats};
pub use orchestrator::{generate_files, TrackingRun, TransferTest};
pub use poller::CompletionPoller;

use std::path::PathBuf;
use thiserror::Error;
use transit_broker::ConnectError;
use transit_tracker::RunReport;

/// Errors that end a run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error accessing {0:?}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Nothing to track")]
    EmptyWatchSet,

    #[error("Run task failed: {0}")]
    Task(String),

    /// A run task failed after tracking started
    #[error("{error}")]
    Aborted {
        error: Box<RunError>,
        report: Box<RunReport>,
    },
}

impl RunError {
    /// What was observed before the run failed, if tracking had started
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunError::Aborted { report, .. } => Some(report),
            _ => None,
        }
    }
}
