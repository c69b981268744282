//! Raw message body decoding.

use crate::{EventKind, EventRecord, TIMESTAMP_FORMAT};
use chrono::{DateTime, NaiveDateTime, Timelike};
use serde_json::{Map, Value};

/// Error decoding a message body
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field has the wrong type: {0}")]
    InvalidField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Decode a raw message body into an event record
pub fn decode(raw: &[u8]) -> Result<EventRecord, DecodeError> {
    let Value::Object(mut root) = serde_json::from_slice::<Value>(raw)? else {
        return Err(DecodeError::NotAnObject);
    };

    let event_type = match root.remove("event_type") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(DecodeError::InvalidField("event_type")),
        None => return Err(DecodeError::MissingField("event_type")),
    };

    let created_at = match root.remove("created_at") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(DecodeError::InvalidField("created_at")),
        None => return Err(DecodeError::MissingField("created_at")),
    };

    let mut payload = match root.remove("payload") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(DecodeError::InvalidField("payload")),
        None => return Err(DecodeError::MissingField("payload")),
    };
    normalize_time_keys(&mut payload);

    Ok(EventRecord {
        kind: EventKind::classify(&event_type),
        occurred_at: parse_timestamp(&created_at)?,
        event_type,
        payload,
    })
}

/// Truncate sub-second precision from every `*_at` string value
pub fn normalize_time_keys(payload: &mut Map<String, Value>) {
    for (key, value) in payload.iter_mut() {
        if !key.ends_with("_at") {
            continue;
        }
        if let Value::String(s) = value {
            let keep = truncate_fraction(s).len();
            s.truncate(keep);
        }
    }
}

/// Drop everything from the first `.` onwards
pub fn truncate_fraction(value: &str) -> &str {
    match value.find('.') {
        Some(idx) => &value[..idx],
        None => value,
    }
}

/// Parse an event bus timestamp, discarding sub-second precision
///
/// Accepts `YYYY-MM-DD HH:MM:SS[.ffffff]`, the same with a `T` separator, and
/// RFC 3339 (converted to UTC).
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, DecodeError> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        let utc = dt.naive_utc();
        return utc
            .with_nanosecond(0)
            .ok_or_else(|| DecodeError::InvalidTimestamp(value.to_string()));
    }

    let whole = truncate_fraction(value);
    NaiveDateTime::parse_from_str(whole, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(whole, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| DecodeError::InvalidTimestamp(value.to_string()))
}
