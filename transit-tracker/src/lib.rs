//! Transit Tracker
//!
//! Correlates transfer lifecycle events with a registered set of
//! `(scope, name, destination)` entities and reports which of them reached a
//! terminal state.

mod engine;
mod entity;
mod report;
mod table;

pub use engine::{CorrelationEngine, IngestOutcome, TrackError};
pub use entity::{EntityId, TransferState, WatchSet, WatchedEntity};
pub use report::{DestinationReport, EntityReport, RunOutcome, RunReport};
pub use table::TrackingTable;
