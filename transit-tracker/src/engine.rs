//! Correlation Engine
//!
//! Matches decoded transfer events against the registered watch set and drives
//! each watched entity through `Queued -> InProgress -> {Done, Failed}`. All
//! mutation and the resolution check happen under one lock, so the delivery path
//! and the completion poller never race.

use crate::entity::{EntityId, TransferState, WatchSet};
use crate::report::{RunOutcome, RunReport};
use crate::table::TrackingTable;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use transit_event::{DecodeError, EventKind, EventRecord, Outcome};

/// Error correlating an event
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Transfer event {event_type} lacks its identity: {source}")]
    Identity {
        event_type: String,
        #[source]
        source: DecodeError,
    },
}

/// What `ingest` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First queued-class event for a watched entity
    Started,
    /// Non-terminal progress (Queued to InProgress)
    Advanced,
    /// A terminal outcome was applied
    Resolved(Outcome),
    /// Repeated event for a non-terminal entity; coalesced
    Duplicate,
    /// The entity already reached a terminal state
    AlreadyTerminal,
    /// The identity or destination is outside the watch set
    NotWatched,
    /// Terminal event for an entity that was never queued
    TerminalBeforeQueued,
    /// Not a transfer lifecycle event
    Ignored,
}

impl IngestOutcome {
    /// Whether the tracking table changed
    pub fn changed(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Started | IngestOutcome::Advanced | IngestOutcome::Resolved(_)
        )
    }
}

/// Per-run correlation state
#[derive(Debug, Default)]
pub struct CorrelationEngine {
    table: RwLock<TrackingTable>,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every pair of the watch set in pre-state
    ///
    /// Already-registered pairs are left untouched. Returns how many were added.
    pub fn track(&self, watch: &WatchSet) -> usize {
        let mut table = self.table.write();
        let added = watch
            .iter()
            .filter(|(id, destination)| table.register((*id).clone(), destination))
            .count();
        debug!(added, total = table.len(), "Registered watch set");
        added
    }

    /// Apply a decoded event to the tracking table
    pub fn ingest(&self, record: &EventRecord) -> Result<IngestOutcome, TrackError> {
        if !record.kind.is_transfer() {
            return Ok(IngestOutcome::Ignored);
        }

        let info = record.transfer().map_err(|source| TrackError::Identity {
            event_type: record.event_type.clone(),
            source,
        })?;
        let id = EntityId::new(info.scope, info.name);

        let mut table = self.table.write();
        let Some(entity) = table.get_mut(&info.destination, &id) else {
            debug!(
                entity = %id,
                destination = %info.destination,
                event_type = %record.event_type,
                "Ignoring event outside the watch set"
            );
            return Ok(IngestOutcome::NotWatched);
        };

        if entity.is_terminal() {
            debug!(
                entity = %id,
                destination = %entity.destination,
                event_type = %record.event_type,
                "Entity already terminal"
            );
            return Ok(IngestOutcome::AlreadyTerminal);
        }

        let outcome = match record.kind {
            EventKind::Queued => {
                let next = if is_submitted(record, info.state.as_deref()) {
                    TransferState::InProgress
                } else {
                    TransferState::Queued
                };
                match entity.state {
                    None => {
                        entity.state = Some(next);
                        IngestOutcome::Started
                    }
                    Some(current) if current.advances_to(next) => {
                        entity.state = Some(next);
                        IngestOutcome::Advanced
                    }
                    Some(_) => IngestOutcome::Duplicate,
                }
            }
            EventKind::Terminal(outcome) => {
                if entity.state.is_none() {
                    warn!(
                        entity = %id,
                        destination = %entity.destination,
                        event_type = %record.event_type,
                        "Terminal event before any queued event; ignoring"
                    );
                    return Ok(IngestOutcome::TerminalBeforeQueued);
                }
                entity.state = Some(TransferState::from_outcome(outcome));
                entity.outcome = Some(outcome);
                entity.completed = true;
                IngestOutcome::Resolved(outcome)
            }
            EventKind::Unrecognized => return Ok(IngestOutcome::Ignored),
        };

        if outcome.changed() {
            if info.request_id.is_some() {
                entity.request_id = info.request_id;
            }
            entity.updated_at = Some(record.occurred_at);
        }

        match outcome {
            IngestOutcome::Resolved(result) => info!(
                entity = %id,
                destination = %entity.destination,
                outcome = ?result,
                "Transfer resolved"
            ),
            _ => debug!(
                entity = %id,
                destination = %entity.destination,
                event_type = %record.event_type,
                outcome = ?outcome,
                "Applied event"
            ),
        }
        Ok(outcome)
    }

    /// True iff the watch set is non-empty and every entity is terminal
    pub fn is_resolved(&self) -> bool {
        self.table.read().all_terminal()
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Current state of one entity
    pub fn state(&self, id: &EntityId, destination: &str) -> Option<Option<TransferState>> {
        self.table.read().get(destination, id).map(|e| e.state)
    }

    /// Per-destination report of the current table
    pub fn snapshot(&self) -> RunReport {
        RunReport::from_table(&self.table.read(), None)
    }

    /// Final report for a finished run
    pub fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport::from_table(&self.table.read(), Some(outcome))
    }
}

fn is_submitted(record: &EventRecord, state: Option<&str>) -> bool {
    record.event_type.eq_ignore_ascii_case("transfer-submitted")
        || state.is_some_and(|s| s.eq_ignore_ascii_case("submitted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(event_type: &str, name: &str, destination: &str) -> EventRecord {
        EventRecord::builder()
            .event_type(event_type)
            .occurred_at(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .and_then(|d| d.and_hms_opt(12, 0, 0))
                    .unwrap(),
            )
            .transfer("u", name, destination)
            .build()
            .unwrap()
    }

    fn engine(names: &[&str], destinations: &[&str]) -> CorrelationEngine {
        let engine = CorrelationEngine::new();
        engine.track(&WatchSet::product("u", names, destinations));
        engine
    }

    #[test]
    fn test_queued_then_done() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let id = EntityId::new("u", "f1");

        assert_eq!(
            engine.ingest(&event("transfer-queued", "f1", "RSE_A")).unwrap(),
            IngestOutcome::Started
        );
        assert_eq!(engine.state(&id, "RSE_A"), Some(Some(TransferState::Queued)));
        assert!(!engine.is_resolved());

        assert_eq!(
            engine.ingest(&event("transfer-done", "f1", "RSE_A")).unwrap(),
            IngestOutcome::Resolved(Outcome::Done)
        );
        assert!(engine.is_resolved());
    }

    #[test]
    fn test_submitted_advances_to_in_progress() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let id = EntityId::new("u", "f1");

        engine.ingest(&event("transfer-queued", "f1", "RSE_A")).unwrap();
        assert_eq!(
            engine.ingest(&event("transfer-submitted", "f1", "RSE_A")).unwrap(),
            IngestOutcome::Advanced
        );
        assert_eq!(
            engine.state(&id, "RSE_A"),
            Some(Some(TransferState::InProgress))
        );

        // a late queued event does not move it back
        assert_eq!(
            engine.ingest(&event("transfer-queued", "f1", "RSE_A")).unwrap(),
            IngestOutcome::Duplicate
        );
        assert_eq!(
            engine.state(&id, "RSE_A"),
            Some(Some(TransferState::InProgress))
        );
    }

    #[test]
    fn test_submitted_state_field() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let record = EventRecord::builder()
            .event_type("transfer-queued")
            .occurred_at(chrono::NaiveDateTime::default())
            .transfer("u", "f1", "RSE_A")
            .field("state", "SUBMITTED")
            .field("request-id", "req-9")
            .build()
            .unwrap();

        assert_eq!(engine.ingest(&record).unwrap(), IngestOutcome::Started);
        let report = engine.snapshot();
        let entity = &report.destinations[0].unresolved[0];
        assert_eq!(entity.state, Some(TransferState::InProgress));
        assert_eq!(entity.request_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn test_terminal_is_sticky() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let id = EntityId::new("u", "f1");

        engine.ingest(&event("transfer-queued", "f1", "RSE_A")).unwrap();
        engine.ingest(&event("transfer-failed", "f1", "RSE_A")).unwrap();

        assert_eq!(
            engine.ingest(&event("transfer-queued", "f1", "RSE_A")).unwrap(),
            IngestOutcome::AlreadyTerminal
        );
        assert_eq!(
            engine.ingest(&event("transfer-done", "f1", "RSE_A")).unwrap(),
            IngestOutcome::AlreadyTerminal
        );
        assert_eq!(engine.state(&id, "RSE_A"), Some(Some(TransferState::Failed)));
    }

    #[test]
    fn test_terminal_before_queued_is_ignored() {
        let engine = engine(&["f1"], &["RSE_A"]);
        assert_eq!(
            engine.ingest(&event("transfer-done", "f1", "RSE_A")).unwrap(),
            IngestOutcome::TerminalBeforeQueued
        );
        assert_eq!(
            engine.state(&EntityId::new("u", "f1"), "RSE_A"),
            Some(None)
        );
        assert!(!engine.is_resolved());
    }

    #[test]
    fn test_unwatched_events_ignored() {
        let engine = engine(&["f1"], &["RSE_A"]);

        for record in [
            event("transfer-queued", "f2", "RSE_A"),
            event("transfer-queued", "f1", "RSE_B"),
            event("transfer-done", "f9", "RSE_Z"),
        ] {
            assert_eq!(engine.ingest(&record).unwrap(), IngestOutcome::NotWatched);
        }
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_unrecognized_event_ignored() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let record = EventRecord::builder()
            .event_type("deletion-done")
            .occurred_at(chrono::NaiveDateTime::default())
            .build()
            .unwrap();
        assert_eq!(engine.ingest(&record).unwrap(), IngestOutcome::Ignored);
    }

    #[test]
    fn test_missing_identity_is_error() {
        let engine = engine(&["f1"], &["RSE_A"]);
        let record = EventRecord::builder()
            .event_type("transfer-done")
            .occurred_at(chrono::NaiveDateTime::default())
            .field("scope", "u")
            .build()
            .unwrap();
        assert!(matches!(
            engine.ingest(&record),
            Err(TrackError::Identity { .. })
        ));
    }

    #[test]
    fn test_empty_registration_never_resolves() {
        let engine = CorrelationEngine::new();
        assert!(engine.is_empty());
        assert!(!engine.is_resolved());
    }
}
