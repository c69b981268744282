use std::sync::Arc;
use transit_event::{decode, EventRecord};
use transit_tracker::{
    CorrelationEngine, EntityId, IngestOutcome, RunOutcome, TransferState, WatchSet,
};

fn body(event_type: &str, scope: &str, name: &str, destination: &str) -> String {
    format!(
        r#"{{"event_type":"{event_type}","created_at":"2024-03-01 12:00:00.250","payload":{{"scope":"{scope}","name":"{name}","dst-rse":"{destination}","request-id":"req-{name}","queued_at":"2024-03-01 11:59:59.999"}}}}"#
    )
}

fn record(event_type: &str, name: &str, destination: &str) -> EventRecord {
    decode(body(event_type, "u", name, destination).as_bytes()).unwrap()
}

#[test]
fn test_resolves_exactly_when_all_terminal() {
    let names = ["f1", "f2", "f3"];
    let destinations = ["RSE_A", "RSE_B"];
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::product("u", names, destinations));

    for name in names {
        for destination in destinations {
            engine.ingest(&record("transfer-queued", name, destination)).unwrap();
        }
    }

    let mut remaining = names.len() * destinations.len();
    for (i, name) in names.iter().enumerate() {
        for destination in destinations {
            assert!(!engine.is_resolved());
            let kind = if i % 2 == 0 { "transfer-done" } else { "transfer-failed" };
            engine.ingest(&record(kind, name, destination)).unwrap();
            remaining -= 1;
            assert_eq!(engine.is_resolved(), remaining == 0);
        }
    }
}

#[test]
fn test_unknown_terminal_leaves_table_unchanged() {
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::product("u", ["f1"], ["RSE_A"]));
    let before = engine.snapshot();

    let outcome = engine
        .ingest(&record("transfer-done", "ghost", "RSE_A"))
        .unwrap();
    assert_eq!(outcome, IngestOutcome::NotWatched);
    assert_eq!(engine.snapshot(), before);
    assert_eq!(engine.len(), 1);
}

#[test]
fn test_queued_does_not_revert_terminal() {
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::product("u", ["f1"], ["RSE_A"]));

    engine.ingest(&record("transfer-queued", "f1", "RSE_A")).unwrap();
    engine.ingest(&record("transfer-done", "f1", "RSE_A")).unwrap();
    engine.ingest(&record("transfer-queued", "f1", "RSE_A")).unwrap();

    assert_eq!(
        engine.state(&EntityId::new("u", "f1"), "RSE_A"),
        Some(Some(TransferState::Done))
    );
    assert!(engine.is_resolved());
}

#[test]
fn test_retrack_does_not_duplicate() {
    let engine = CorrelationEngine::new();
    let watch = WatchSet::product("u", ["f1", "f2"], ["RSE_A"]);

    assert_eq!(engine.track(&watch), 2);
    engine.ingest(&record("transfer-queued", "f1", "RSE_A")).unwrap();

    assert_eq!(engine.track(&watch), 0);
    assert_eq!(engine.len(), 2);
    // re-registering keeps existing progress
    assert_eq!(
        engine.state(&EntityId::new("u", "f1"), "RSE_A"),
        Some(Some(TransferState::Queued))
    );
}

#[test]
fn test_scenario_a_two_destinations() {
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::product("u", ["f1"], ["RSE_A", "RSE_B"]));

    engine.ingest(&record("transfer-queued", "f1", "RSE_A")).unwrap();
    engine.ingest(&record("transfer-queued", "f1", "RSE_B")).unwrap();
    engine.ingest(&record("transfer-done", "f1", "RSE_A")).unwrap();
    assert!(!engine.is_resolved());

    engine.ingest(&record("transfer-done", "f1", "RSE_B")).unwrap();
    assert!(engine.is_resolved());

    let report = engine.report(RunOutcome::Resolved);
    assert!(report.is_complete());
    assert_eq!(report.destination("RSE_A").unwrap().done, 1);
    assert_eq!(report.destination("RSE_B").unwrap().done, 1);
}

#[test]
fn test_scenario_b_failed_without_registration() {
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::new());

    let outcome = engine
        .ingest(&record("transfer-failed", "f1", "RSE_A"))
        .unwrap();
    assert_eq!(outcome, IngestOutcome::NotWatched);
    assert!(engine.is_empty());
    assert!(!engine.is_resolved());
}

#[test]
fn test_partial_report_marks_unresolved() {
    let engine = CorrelationEngine::new();
    engine.track(&WatchSet::product("u", ["f1", "f2"], ["RSE_A"]));
    engine.ingest(&record("transfer-queued", "f1", "RSE_A")).unwrap();
    engine.ingest(&record("transfer-queued", "f2", "RSE_A")).unwrap();
    engine.ingest(&record("transfer-done", "f1", "RSE_A")).unwrap();

    let report = engine.report(RunOutcome::TimedOut);
    assert_eq!(report.outcome, Some(RunOutcome::TimedOut));
    assert_eq!(report.resolved_count(), 1);
    assert_eq!(report.unresolved_count(), 1);

    let dest = report.destination("RSE_A").unwrap();
    assert_eq!(dest.resolved[0].name, "f1");
    assert_eq!(dest.resolved[0].request_id.as_deref(), Some("req-f1"));
    assert_eq!(dest.resolved[0].updated_at.as_deref(), Some("2024-03-01 12:00:00"));
    assert_eq!(dest.unresolved[0].name, "f2");
    assert_eq!(dest.unresolved[0].state, Some(TransferState::Queued));
}

#[test]
fn test_concurrent_ingest_and_poll() {
    let names: Vec<String> = (0..50).map(|i| format!("f{i}")).collect();
    let engine = Arc::new(CorrelationEngine::new());
    engine.track(&WatchSet::product("u", &names, ["RSE_A"]));

    let writer = {
        let engine = engine.clone();
        let names = names.clone();
        std::thread::spawn(move || {
            for name in &names {
                engine.ingest(&record("transfer-queued", name, "RSE_A")).unwrap();
                engine.ingest(&record("transfer-done", name, "RSE_A")).unwrap();
            }
        })
    };

    let reader = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            let mut seen_resolved = false;
            for _ in 0..1000 {
                let resolved = engine.is_resolved();
                // resolution never flips back
                assert!(!(seen_resolved && !resolved));
                seen_resolved |= resolved;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert!(engine.is_resolved());
}
