//! Transit Event Model
//!
//! This module defines the event record produced from the control-plane event
//! stream. Records are decoded once and classified into a closed set of kinds so
//! that consumers never re-parse the event type string.

mod decode;

pub use decode::{decode, normalize_time_keys, parse_timestamp, truncate_fraction, DecodeError};

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};

/// Timestamp layout used by the event bus and the downstream index
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome carried by a terminal transfer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    /// Transfer completed at the destination
    Done,
    /// Transfer ran and failed
    Failed,
    /// Transfer could not be submitted to the transfer tool
    SubmissionFailed,
}

impl Outcome {
    /// True for outcomes that leave the replica unavailable
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Done)
    }
}

/// Classification of an event type string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A transfer was queued or progressed without finishing
    Queued,
    /// A transfer reached a final outcome
    Terminal(Outcome),
    /// Well-formed but not relevant to transfer tracking
    Unrecognized,
}

impl EventKind {
    /// Classify an event type string
    pub fn classify(event_type: &str) -> Self {
        match event_type.to_ascii_lowercase().as_str() {
            "transfer-queued" | "transfer-submitted" => EventKind::Queued,
            "transfer-done" => EventKind::Terminal(Outcome::Done),
            "transfer-failed" => EventKind::Terminal(Outcome::Failed),
            "transfer-submission_failed" | "transfer-submission-failed" => {
                EventKind::Terminal(Outcome::SubmissionFailed)
            }
            _ => EventKind::Unrecognized,
        }
    }

    /// Check whether this kind is relevant to transfer tracking
    pub fn is_transfer(&self) -> bool {
        !matches!(self, EventKind::Unrecognized)
    }
}

/// Transfer attributes extracted from an event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    /// Namespace of the file
    pub scope: String,

    /// File name within the scope
    pub name: String,

    /// Destination location (RSE) of the transfer
    pub destination: String,

    /// Request correlation id assigned by the control plane
    pub request_id: Option<String>,

    /// Explicit or implied transfer state
    pub state: Option<String>,
}

/// Represents a single decoded event
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Event type tag as sent by the producer
    pub event_type: String,

    /// Classified kind of `event_type`
    pub kind: EventKind,

    /// Creation time of the event, truncated to whole seconds
    pub occurred_at: NaiveDateTime,

    /// Protocol-specific attributes
    pub payload: Map<String, Value>,
}

impl EventRecord {
    /// Create an event builder
    pub fn builder() -> EventRecordBuilder {
        EventRecordBuilder::default()
    }

    /// Get a payload value as a string slice
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Extract the transfer attributes carried by this event
    ///
    /// `transfer-done` and `transfer-failed` imply their state; other events use the
    /// payload's `state` field when present.
    pub fn transfer(&self) -> Result<TransferInfo, DecodeError> {
        let required = |key: &'static str| -> Result<String, DecodeError> {
            match self.payload.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(DecodeError::InvalidField(key)),
                None => Err(DecodeError::MissingField(key)),
            }
        };

        let state = match self.kind {
            EventKind::Terminal(Outcome::Done) => Some("done".to_string()),
            EventKind::Terminal(Outcome::Failed) => Some("failed".to_string()),
            _ => self.payload_str("state").map(str::to_string),
        };

        Ok(TransferInfo {
            scope: required("scope")?,
            name: required("name")?,
            destination: required("dst-rse")?,
            request_id: self.payload_str("request-id").map(str::to_string),
            state,
        })
    }

    /// Build the document written to the downstream index
    pub fn document(&self) -> Value {
        let mut doc = self.payload.clone();
        doc.insert(
            "created_at".to_string(),
            Value::String(self.occurred_at.format(TIMESTAMP_FORMAT).to_string()),
        );
        doc.insert(
            "event_type".to_string(),
            Value::String(self.event_type.clone()),
        );
        Value::Object(doc)
    }
}

/// Event builder for convenient record construction
#[derive(Debug, Default)]
pub struct EventRecordBuilder {
    event_type: Option<String>,
    occurred_at: Option<NaiveDateTime>,
    payload: Map<String, Value>,
}

impl EventRecordBuilder {
    /// Set event type
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set creation time
    pub fn occurred_at(mut self, ts: NaiveDateTime) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    /// Add a payload field
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Add the identity fields of a transfer event
    pub fn transfer(self, scope: &str, name: &str, destination: &str) -> Self {
        self.field("scope", scope)
            .field("name", name)
            .field("dst-rse", destination)
    }

    /// Build the record
    pub fn build(self) -> Result<EventRecord, BuildError> {
        let event_type = self
            .event_type
            .ok_or(BuildError::MissingField("event_type"))?;
        Ok(EventRecord {
            kind: EventKind::classify(&event_type),
            event_type,
            occurred_at: self
                .occurred_at
                .ok_or(BuildError::MissingField("occurred_at"))?,
            payload: self.payload,
        })
    }
}

/// Error building an event
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
