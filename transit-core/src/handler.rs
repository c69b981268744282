//! Delivery handlers
//!
//! The listener hands every delivery to a `DeliveryHandler`, which decodes it once
//! and decides how each source message is settled.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use transit_broker::{Acknowledgement, Delivery};
use transit_event::decode;
use transit_ingest::{IndexClient, IngestSink, IngestStats};
use transit_tracker::CorrelationEngine;

/// Consumption strategy behind the listener
#[async_trait]
pub trait DeliveryHandler: Send {
    /// Process one delivery; returned acknowledgements are applied in order
    async fn handle(&mut self, delivery: Delivery) -> Vec<Acknowledgement>;

    /// Called once when the listener stops
    async fn finish(&mut self) -> Vec<Acknowledgement> {
        Vec::new()
    }
}

/// Counters for the correlation path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub applied: u64,
    pub ignored: u64,
    pub malformed: u64,
}

/// Feeds transfer events to a `CorrelationEngine`
///
/// Every message is acknowledged once processed; the tracking table is the only
/// state that matters for a run.
pub struct CorrelationHandler {
    engine: Arc<CorrelationEngine>,
    stats: CorrelationStats,
}

impl CorrelationHandler {
    pub fn new(engine: Arc<CorrelationEngine>) -> Self {
        Self {
            engine,
            stats: CorrelationStats::default(),
        }
    }

    pub fn stats(&self) -> CorrelationStats {
        self.stats
    }
}

#[async_trait]
impl DeliveryHandler for CorrelationHandler {
    async fn handle(&mut self, delivery: Delivery) -> Vec<Acknowledgement> {
        match decode(&delivery.body) {
            Ok(record) => match self.engine.ingest(&record) {
                Ok(outcome) if outcome.changed() => self.stats.applied += 1,
                Ok(_) => self.stats.ignored += 1,
                Err(e) => {
                    warn!(
                        message_id = %delivery.message_id,
                        event_type = %record.event_type,
                        error = %e,
                        "Dropping transfer event"
                    );
                    self.stats.malformed += 1;
                }
            },
            Err(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Dropping undecodable message"
                );
                self.stats.malformed += 1;
            }
        }
        vec![Acknowledgement::ack(delivery.receipt)]
    }
}

/// Forwards events to a document index through an `IngestSink`
pub struct IngestHandler<I: IndexClient> {
    sink: IngestSink<I>,
}

impl<I: IndexClient> IngestHandler<I> {
    pub fn new(sink: IngestSink<I>) -> Self {
        Self { sink }
    }

    pub fn stats(&self) -> IngestStats {
        self.sink.stats()
    }

    pub fn sink(&self) -> &IngestSink<I> {
        &self.sink
    }
}

#[async_trait]
impl<I: IndexClient> DeliveryHandler for IngestHandler<I> {
    async fn handle(&mut self, delivery: Delivery) -> Vec<Acknowledgement> {
        match decode(&delivery.body) {
            Ok(record) => self.sink.push(delivery.receipt, record).await,
            Err(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Acknowledging undecodable message"
                );
                vec![self.sink.reject_malformed(delivery.receipt)]
            }
        }
    }

    async fn finish(&mut self) -> Vec<Acknowledgement> {
        if self.sink.pending() > 0 {
            debug!(pending = self.sink.pending(), "Flushing partial batch");
        }
        self.sink.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use transit_broker::{Disposition, Message};
    use transit_ingest::MemoryIndex;
    use transit_tracker::WatchSet;

    fn delivery(n: usize, body: &'static str) -> Delivery {
        Delivery::new(
            Message {
                message_id: format!("msg-{n}"),
                ack_id: format!("msg-{n}"),
                headers: Vec::new(),
                body: Bytes::from_static(body.as_bytes()),
            },
            1,
        )
    }

    const QUEUED: &str = r#"{"event_type":"transfer-queued","created_at":"2024-03-01 12:00:00","payload":{"scope":"u","name":"f1","dst-rse":"RSE_A"}}"#;
    const NO_IDENTITY: &str = r#"{"event_type":"transfer-done","created_at":"2024-03-01 12:00:00","payload":{"scope":"u"}}"#;
    const RULE: &str = r#"{"event_type":"rule-ok","created_at":"2024-03-01 12:00:00","payload":{}}"#;

    #[tokio::test]
    async fn test_correlation_acks_everything() {
        let engine = Arc::new(CorrelationEngine::new());
        engine.track(&WatchSet::product("u", ["f1"], ["RSE_A"]));
        let mut handler = CorrelationHandler::new(engine);

        for (n, body) in [QUEUED, "{broken", NO_IDENTITY, RULE].into_iter().enumerate() {
            let acks = handler.handle(delivery(n, body)).await;
            assert_eq!(acks.len(), 1);
            assert_eq!(acks[0].disposition, Disposition::Ack);
        }

        let stats = handler.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.malformed, 2);
    }

    #[tokio::test]
    async fn test_ingest_handler_paths() {
        let mut handler = IngestHandler::new(IngestSink::new(MemoryIndex::new(), 2));

        let acks = handler.handle(delivery(0, "not json")).await;
        assert_eq!(acks[0].disposition, Disposition::Ack);

        let acks = handler.handle(delivery(1, RULE)).await;
        assert_eq!(acks[0].disposition, Disposition::Ack);

        assert!(handler.handle(delivery(2, QUEUED)).await.is_empty());
        let acks = handler.finish().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].receipt.ack_id, "msg-2");

        let stats = handler.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.written, 1);
    }
}
