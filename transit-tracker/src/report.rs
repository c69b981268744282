//! Run report: resolved vs. unresolved entities grouped by destination.

use crate::entity::{TransferState, WatchedEntity};
use crate::table::TrackingTable;
use serde::Serialize;
use std::fmt;
use transit_event::{Outcome, TIMESTAMP_FORMAT};

/// How a tracking run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every watched entity reached a terminal state
    Resolved,
    /// The deadline elapsed first
    TimedOut,
    /// Stopped by an external shutdown signal
    Interrupted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Resolved => write!(f, "resolved"),
            RunOutcome::TimedOut => write!(f, "timed out"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub scope: String,
    pub name: String,
    pub state: Option<TransferState>,
    pub outcome: Option<Outcome>,
    pub request_id: Option<String>,
    pub updated_at: Option<String>,
}

impl From<&WatchedEntity> for EntityReport {
    fn from(entity: &WatchedEntity) -> Self {
        Self {
            scope: entity.id.scope.clone(),
            name: entity.id.name.clone(),
            state: entity.state,
            outcome: entity.outcome,
            request_id: entity.request_id.clone(),
            updated_at: entity
                .updated_at
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationReport {
    pub destination: String,
    pub resolved: Vec<EntityReport>,
    pub unresolved: Vec<EntityReport>,
    pub done: usize,
    pub failed: usize,
}

impl DestinationReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Snapshot of a tracking run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// `None` while the run is still going
    pub outcome: Option<RunOutcome>,
    pub destinations: Vec<DestinationReport>,
}

impl RunReport {
    pub(crate) fn from_table(table: &TrackingTable, outcome: Option<RunOutcome>) -> Self {
        let mut names: Vec<&str> = table.destinations().collect();
        names.sort_unstable();

        let destinations = names
            .into_iter()
            .map(|destination| {
                let mut entities: Vec<&WatchedEntity> = table.bucket(destination).collect();
                entities.sort_by(|a, b| a.id.cmp(&b.id));

                let (resolved, unresolved): (Vec<_>, Vec<_>) =
                    entities.into_iter().partition(|e| e.is_terminal());
                let done = resolved
                    .iter()
                    .filter(|e| e.state == Some(TransferState::Done))
                    .count();

                DestinationReport {
                    destination: destination.to_string(),
                    failed: resolved.len() - done,
                    done,
                    resolved: resolved.into_iter().map(EntityReport::from).collect(),
                    unresolved: unresolved.into_iter().map(EntityReport::from).collect(),
                }
            })
            .collect();

        Self {
            outcome,
            destinations,
        }
    }

    pub fn total(&self) -> usize {
        self.resolved_count() + self.unresolved_count()
    }

    pub fn resolved_count(&self) -> usize {
        self.destinations.iter().map(|d| d.resolved.len()).sum()
    }

    pub fn unresolved_count(&self) -> usize {
        self.destinations.iter().map(|d| d.unresolved.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.destinations.iter().map(|d| d.failed).sum()
    }

    /// Every entity reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.total() > 0 && self.unresolved_count() == 0
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| d.destination == name)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "in progress".to_string());
        writeln!(
            f,
            "Run {}: {}/{} resolved ({} failed)",
            outcome,
            self.resolved_count(),
            self.total(),
            self.failed_count()
        )?;

        for dest in &self.destinations {
            writeln!(
                f,
                "  {}: {} done, {} failed, {} unresolved",
                dest.destination,
                dest.done,
                dest.failed,
                dest.unresolved.len()
            )?;
            for entity in dest.resolved.iter().chain(&dest.unresolved) {
                let state = entity.state.map(|s| s.as_str()).unwrap_or("unseen");
                writeln!(f, "    {:<12} {}:{}", state, entity.scope, entity.name)?;
            }
        }
        Ok(())
    }
}
