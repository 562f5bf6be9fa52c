//! Normalization from loosely-typed gateway payloads to [`RawRecord`].
//!
//! Required fields are `id` and `date`; everything else has a default.
//! Payloads that cannot produce both are rejected and the caller quarantines
//! them.

use chrono::{DateTime, Utc};
use medwh_core::RawRecord;
use serde_json::Value;

use crate::error::CollectorError;

/// Photo presence as reported by the payload's `media` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    None,
    Photo,
    Other,
}

/// Normalizes one payload into a [`RawRecord`] for `source_id`.
///
/// Accepts `id` as an integer or numeric string and `date` as an RFC 3339
/// string or Unix seconds. Text is read from `message`, falling back to
/// `text`. Negative counters are clamped to zero.
///
/// # Errors
///
/// Returns [`CollectorError::Normalization`] if `id` or `date` is missing or
/// unparseable.
pub fn normalize_message(
    source_id: &str,
    payload: Value,
    collected_at: DateTime<Utc>,
) -> Result<RawRecord, CollectorError> {
    let message_id = parse_id(payload.get("id")).ok_or_else(|| CollectorError::Normalization {
        reason: "missing or non-integer 'id'".to_string(),
    })?;

    let timestamp = parse_date(payload.get("date")).ok_or_else(|| {
        CollectorError::Normalization {
            reason: format!("message {message_id} has missing or unparseable 'date'"),
        }
    })?;

    let text = payload
        .get("message")
        .or_else(|| payload.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let media = media_kind(&payload);

    Ok(RawRecord {
        message_id,
        source_id: source_id.to_string(),
        timestamp,
        text,
        has_media: media != MediaKind::None,
        media_reference: None,
        view_count: counter(&payload, "views"),
        forward_count: counter(&payload, "forwards"),
        collected_at,
        raw_payload: payload,
    })
}

/// Classifies the payload's `media` object. Only photos are downloaded.
#[must_use]
pub fn media_kind(payload: &Value) -> MediaKind {
    match payload.get("media") {
        None | Some(Value::Null) => MediaKind::None,
        Some(media) => match media.get("type").and_then(Value::as_str) {
            Some("photo") => MediaKind::Photo,
            _ => MediaKind::Other,
        },
    }
}

fn parse_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn parse_date(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn counter(payload: &Value, field: &str) -> i64 {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0)
}

#[cfg(test)]
#[path = "normalize_test.rs"]
mod tests;
