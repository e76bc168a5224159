//! Stream wire codec for [`UnifiedEvent`].
//!
//! The broker carries each event as a flat map of string fields. Complex
//! fields (`metadata`, `context`, `attachments`) are embedded as JSON
//! strings under their own keys; `timestamp` is ISO-8601 with timezone.
//! Optional fields serialize as empty strings so the field set is stable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ModelError, Result};
use crate::event::{AttachmentMeta, UnifiedEvent};

/// Encode an event into the flat field map appended to the stream.
pub fn encode(event: &UnifiedEvent) -> Vec<(String, String)> {
    fn opt(value: &Option<String>) -> String {
        value.clone().unwrap_or_default()
    }

    vec![
        ("event_id".into(), event.event_id.to_string()),
        ("event_type".into(), event.event_type.to_string()),
        ("source".into(), event.source.to_string()),
        ("source_id".into(), opt(&event.source_id)),
        ("content".into(), event.content.clone()),
        ("content_type".into(), event.content_type.as_str().into()),
        ("user_id".into(), opt(&event.user_id)),
        ("user_external_id".into(), opt(&event.user_external_id)),
        ("user_name".into(), opt(&event.user_name)),
        ("session_id".into(), opt(&event.session_id)),
        ("thread_id".into(), opt(&event.thread_id)),
        ("idempotency_key".into(), event.idempotency_key.clone()),
        ("priority".into(), event.priority.as_str().into()),
        ("timestamp".into(), event.timestamp.to_rfc3339()),
        (
            "metadata".into(),
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".into()),
        ),
        (
            "context".into(),
            serde_json::to_string(&event.context).unwrap_or_else(|_| "{}".into()),
        ),
        (
            "attachments".into(),
            serde_json::to_string(&event.attachments)
                .unwrap_or_else(|_| "[]".into()),
        ),
    ]
}

/// Decode a field map read back from the stream.
///
/// Timezones normalize to UTC. Fields missing from the map behave like
/// empty strings, so producers may omit empty optionals.
pub fn decode(fields: &BTreeMap<String, String>) -> Result<UnifiedEvent> {
    fn get<'m>(fields: &'m BTreeMap<String, String>, key: &str) -> &'m str {
        fields.get(key).map(String::as_str).unwrap_or("")
    }

    fn non_empty(value: &str) -> Option<String> {
        if value.is_empty() { None } else { Some(value.to_owned()) }
    }

    let raw_id = get(fields, "event_id");
    if raw_id.is_empty() {
        return Err(ModelError::MissingField("event_id"));
    }
    let event_id =
        Uuid::parse_str(raw_id).map_err(|e| ModelError::InvalidField {
            field: "event_id",
            reason: e.to_string(),
        })?;

    let raw_ts = get(fields, "timestamp");
    if raw_ts.is_empty() {
        return Err(ModelError::MissingField("timestamp"));
    }
    let timestamp = DateTime::parse_from_rfc3339(raw_ts)
        .map_err(|e| ModelError::InvalidField {
            field: "timestamp",
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    let idempotency_key = get(fields, "idempotency_key");
    if idempotency_key.is_empty() {
        return Err(ModelError::MissingField("idempotency_key"));
    }

    let metadata: BTreeMap<String, String> = decode_json_field(
        get(fields, "metadata"),
        "metadata",
        BTreeMap::new,
    )?;
    let context: BTreeMap<String, String> =
        decode_json_field(get(fields, "context"), "context", BTreeMap::new)?;
    let attachments: Vec<AttachmentMeta> = decode_json_field(
        get(fields, "attachments"),
        "attachments",
        Vec::new,
    )?;

    Ok(UnifiedEvent {
        event_id,
        event_type: get(fields, "event_type").parse()?,
        source: get(fields, "source").parse()?,
        source_id: non_empty(get(fields, "source_id")),
        content: get(fields, "content").to_owned(),
        content_type: get(fields, "content_type").parse()?,
        user_id: non_empty(get(fields, "user_id")),
        user_external_id: non_empty(get(fields, "user_external_id")),
        user_name: non_empty(get(fields, "user_name")),
        session_id: non_empty(get(fields, "session_id")),
        thread_id: non_empty(get(fields, "thread_id")),
        idempotency_key: idempotency_key.to_owned(),
        priority: get(fields, "priority").parse()?,
        timestamp,
        metadata,
        context,
        attachments,
    })
}

fn decode_json_field<T: serde::de::DeserializeOwned>(
    raw: &str,
    field: &'static str,
    default: impl FnOnce() -> T,
) -> Result<T> {
    if raw.is_empty() {
        return Ok(default());
    }
    serde_json::from_str(raw).map_err(|e| ModelError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ContentType, EventSource, EventType, Priority};
    use chrono::TimeZone;

    fn sample() -> UnifiedEvent {
        let mut event = UnifiedEvent::new(
            EventType::Email,
            EventSource::Email,
            "email:<rfq-1@ex.com>",
            "Please quote 100 pcs.",
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap(),
        );
        event.source_id = Some("<rfq-1@ex.com>".into());
        event.user_external_id = Some("buyer@ex.com".into());
        event.user_name = Some("Buyer".into());
        event.priority = Priority::High;
        event.content_type = ContentType::Text;
        event.metadata.insert("subject".into(), "RFQ".into());
        event.context.insert("channel".into(), "inbox".into());
        event.attachments.push(AttachmentMeta {
            filename: "quote.pdf".into(),
            media_type: "application/pdf".into(),
            size_bytes: 1024,
            storage_key: "emails/attachments/1/x/quote.pdf".into(),
            inline: false,
            signature: false,
            content_id: None,
        });
        event
    }

    #[test]
    fn round_trip() {
        let event = sample();
        let fields: BTreeMap<String, String> =
            encode(&event).into_iter().collect();
        let decoded = decode(&fields).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn round_trip_normalizes_to_utc() {
        let mut fields: BTreeMap<String, String> =
            encode(&sample()).into_iter().collect();
        fields.insert("timestamp".into(), "2025-03-14T10:26:53+01:00".into());
        let decoded = decode(&fields).unwrap();
        assert_eq!(
            decoded.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
        );
    }

    #[test]
    fn missing_event_id_is_rejected() {
        let mut fields: BTreeMap<String, String> =
            encode(&sample()).into_iter().collect();
        fields.remove("event_id");
        assert!(matches!(
            decode(&fields),
            Err(ModelError::MissingField("event_id"))
        ));
    }

    #[test]
    fn empty_optionals_decode_as_none() {
        let mut fields: BTreeMap<String, String> =
            encode(&sample()).into_iter().collect();
        fields.insert("session_id".into(), String::new());
        fields.insert("metadata".into(), String::new());
        let decoded = decode(&fields).unwrap();
        assert_eq!(decoded.session_id, None);
        assert!(decoded.metadata.is_empty());
    }
}
