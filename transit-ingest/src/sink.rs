//! Batch Ingestion Sink
//!
//! Buffers `(receipt, record)` pairs up to `chunk_size`, then writes each
//! buffered document to its category's index. Every buffered entry yields exactly
//! one acknowledgement: `Ack` when the write succeeded, `Nack` otherwise. The
//! batch is emptied by every flush whatever the outcome; redelivery is the retry.

use crate::{Category, IndexClient};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};
use transit_broker::{Acknowledgement, Receipt};
use transit_event::EventRecord;

/// Counters kept over the life of a sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Documents the index confirmed
    pub written: u64,
    /// Writes rejected or failed; left for redelivery
    pub failed: u64,
    /// Well-formed events outside every category
    pub skipped: u64,
    /// Bodies that did not decode
    pub malformed: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} written, {} failed, {} skipped, {} malformed",
            self.written, self.failed, self.skipped, self.malformed
        )
    }
}

/// Buffered entries awaiting a flush
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<(Receipt, Category, EventRecord)>,
}

impl Batch {
    pub fn push(&mut self, receipt: Receipt, category: Category, record: EventRecord) {
        self.entries.push((receipt, category, record));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry, leaving the batch empty
    pub fn take(&mut self) -> Vec<(Receipt, Category, EventRecord)> {
        std::mem::take(&mut self.entries)
    }
}

pub struct IngestSink<I: IndexClient> {
    index: I,
    chunk_size: usize,
    batch: Batch,
    stats: IngestStats,
}

impl<I: IndexClient> IngestSink<I> {
    /// Create a sink; a chunk size of zero behaves as one
    pub fn new(index: I, chunk_size: usize) -> Self {
        Self {
            index,
            chunk_size: chunk_size.max(1),
            batch: Batch::default(),
            stats: IngestStats::default(),
        }
    }

    /// Buffer a decoded record, flushing once the batch is full
    ///
    /// Records outside every category are acknowledged at once.
    pub async fn push(&mut self, receipt: Receipt, record: EventRecord) -> Vec<Acknowledgement> {
        let Some(category) = Category::classify(&record.event_type) else {
            debug!(
                event_type = %record.event_type,
                ack_id = %receipt.ack_id,
                "Skipping uncategorized event"
            );
            self.stats.skipped += 1;
            return vec![Acknowledgement::ack(receipt)];
        };

        self.batch.push(receipt, category, record);
        if self.batch.len() >= self.chunk_size {
            self.flush().await
        } else {
            Vec::new()
        }
    }

    /// Account for a body that failed to decode; it is acknowledged and dropped
    pub fn reject_malformed(&mut self, receipt: Receipt) -> Acknowledgement {
        self.stats.malformed += 1;
        Acknowledgement::ack(receipt)
    }

    /// Write every buffered document and settle its source message
    pub async fn flush(&mut self) -> Vec<Acknowledgement> {
        let entries = self.batch.take();
        let mut acks = Vec::with_capacity(entries.len());

        for (receipt, category, record) in entries {
            let document = record.document();
            match self.index.write(category, &document).await {
                Ok(()) => {
                    self.stats.written += 1;
                    acks.push(Acknowledgement::ack(receipt));
                }
                Err(e) => {
                    warn!(
                        index = %category,
                        client = self.index.name(),
                        event_type = %record.event_type,
                        ack_id = %receipt.ack_id,
                        error = %e,
                        "Index write failed; leaving message for redelivery"
                    );
                    self.stats.failed += 1;
                    acks.push(Acknowledgement::nack(receipt));
                }
            }
        }

        if !acks.is_empty() {
            debug!(entries = acks.len(), stats = %self.stats, "Flushed batch");
        }
        acks
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn index(&self) -> &I {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryIndex;
    use transit_broker::Disposition;

    fn record(event_type: &str) -> EventRecord {
        EventRecord::builder()
            .event_type(event_type)
            .occurred_at(chrono::NaiveDateTime::default())
            .transfer("u", "f1", "RSE_A")
            .build()
            .unwrap()
    }

    fn receipt(n: usize) -> Receipt {
        Receipt {
            ack_id: format!("msg-{n}"),
            generation: 1,
        }
    }

    #[tokio::test]
    async fn test_chunk_size_one_flushes_each_push() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 1);
        let acks = sink.push(receipt(1), record("transfer-done")).await;

        assert_eq!(acks, vec![Acknowledgement::ack(receipt(1))]);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.index().documents().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_waits_for_chunk_size() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 3);
        assert!(sink.push(receipt(1), record("transfer-queued")).await.is_empty());
        assert!(sink.push(receipt(2), record("deletion-done")).await.is_empty());
        assert_eq!(sink.pending(), 2);

        let acks = sink.push(receipt(3), record("transfer-done")).await;
        assert_eq!(acks.len(), 3);
        assert_eq!(sink.pending(), 0);

        let categories: Vec<Category> =
            sink.index().documents().into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            categories,
            vec![Category::Transfer, Category::Deletion, Category::Transfer]
        );
    }

    #[tokio::test]
    async fn test_uncategorized_acked_immediately() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 5);
        let acks = sink.push(receipt(1), record("rule-ok")).await;

        assert_eq!(acks, vec![Acknowledgement::ack(receipt(1))]);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.stats().skipped, 1);
        assert_eq!(sink.index().attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_nacked() {
        let index = MemoryIndex::new();
        index.script([false]);
        let mut sink = IngestSink::new(index, 1);

        let acks = sink.push(receipt(1), record("transfer-failed")).await;
        assert_eq!(acks, vec![Acknowledgement::nack(receipt(1))]);
        assert_eq!(sink.stats().failed, 1);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_empty_batch() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 2);
        assert!(sink.flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_document_carries_event_fields() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 1);
        sink.push(receipt(1), record("transfer-done")).await;

        let (_, doc) = &sink.index().documents()[0];
        assert_eq!(doc["event_type"], "transfer-done");
        assert_eq!(doc["created_at"], "1970-01-01 00:00:00");
        assert_eq!(doc["dst-rse"], "RSE_A");
    }

    #[test]
    fn test_malformed_is_acked() {
        let mut sink = IngestSink::new(MemoryIndex::new(), 1);
        let ack = sink.reject_malformed(receipt(4));
        assert_eq!(ack.disposition, Disposition::Ack);
        assert_eq!(sink.stats().malformed, 1);
    }

    #[test]
    fn test_zero_chunk_size_is_one() {
        let sink = IngestSink::new(MemoryIndex::new(), 0);
        assert_eq!(sink.chunk_size(), 1);
    }
}
