//! Translation between in-memory event values and their column
//! representations. Pure functions; every storage concern (serialization,
//! timezone normalization, tag fallback) lives here.

use serde::Serialize;
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{ActorKind, TraceError};

/// Stored timestamp layout. Microsecond precision, UTC, chosen so lexical
/// and chronological ordering coincide at the storage layer.
const STORED_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

/// Converts caller data into a payload value. This is the boundary where a
/// non-serializable structure (a failing `Serialize` impl, a map with
/// non-string keys) is rejected, before any write is attempted.
///
/// # Errors
/// Returns [`TraceError::Encoding`] when the conversion fails.
pub fn payload_value<T: Serialize>(payload: &T) -> Result<Value, TraceError> {
    serde_json::to_value(payload).map_err(TraceError::Encoding)
}

/// Serializes a payload to compact JSON text. serde_json leaves non-ASCII
/// characters unescaped, which keeps stored payloads readable.
///
/// # Errors
/// Returns [`TraceError::Encoding`] when serialization fails. Write paths
/// abort before any I/O.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String, TraceError> {
    serde_json::to_string(payload).map_err(TraceError::Encoding)
}

/// Decodes stored payload text back into structured data.
///
/// # Errors
/// Returns the underlying `serde_json` error for malformed text; read paths
/// convert it into a corrupt-row sentinel rather than failing the page.
pub fn decode_payload(raw: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Normalizes a timestamp to UTC and formats it in the stored layout.
///
/// # Errors
/// Returns [`TraceError::Timestamp`] when formatting fails.
pub fn encode_timestamp(value: OffsetDateTime) -> Result<String, TraceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&STORED_TIMESTAMP)
        .map_err(|err| TraceError::Timestamp(format!("failed to format timestamp: {err}")))
}

/// Parses a stored timestamp, reinterpreting it as UTC.
///
/// # Errors
/// Returns [`TraceError::Timestamp`] when the text does not match the
/// stored layout.
pub fn decode_timestamp(raw: &str) -> Result<OffsetDateTime, TraceError> {
    PrimitiveDateTime::parse(raw, &STORED_TIMESTAMP)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| TraceError::Timestamp(format!("invalid stored timestamp {raw:?}: {err}")))
}

/// Decodes a stored actor tag, defaulting unrecognized values to
/// [`ActorKind::Anonymous`].
#[must_use]
pub fn decode_actor(raw: &str) -> ActorKind {
    ActorKind::parse(raw).unwrap_or(ActorKind::Anonymous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use time::macros::datetime;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    /// Stand-in for a structure whose serialization cannot complete, e.g. a
    /// cyclic reference in the emitting system.
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cyclic reference"))
        }
    }

    #[test]
    fn timestamp_round_trips_with_microseconds() {
        let instant = datetime!(2026-08-07 12:34:56.789012 UTC);
        let encoded = must(encode_timestamp(instant));
        assert_eq!(encoded, "2026-08-07 12:34:56.789012");
        assert_eq!(must(decode_timestamp(&encoded)), instant);
    }

    #[test]
    fn timestamp_normalizes_offsets_to_utc() {
        let instant = datetime!(2026-08-07 14:00:00.000000 +02:00);
        let encoded = must(encode_timestamp(instant));
        assert_eq!(encoded, "2026-08-07 12:00:00.000000");
    }

    #[test]
    fn timestamp_encoding_is_lexically_sortable() {
        let earlier = must(encode_timestamp(datetime!(2026-08-07 09:59:59.999999 UTC)));
        let later = must(encode_timestamp(datetime!(2026-08-07 10:00:00.000000 UTC)));
        assert!(earlier < later);
    }

    #[test]
    fn decode_rejects_malformed_timestamp() {
        assert!(matches!(
            decode_timestamp("not-a-timestamp"),
            Err(TraceError::Timestamp(_))
        ));
    }

    #[test]
    fn payload_keeps_non_ascii_unescaped() {
        let encoded = must(encode_payload(&json!({"name": "café ∞"})));
        assert!(encoded.contains("café ∞"));
    }

    #[test]
    fn payload_round_trips_structured_values() {
        let payload = json!({"roles": ["admin", "editor"], "count": 3, "nested": {"ok": true}});
        let encoded = must(encode_payload(&payload));
        assert_eq!(must(decode_payload(&encoded)), payload);
    }

    #[test]
    fn failing_serialize_is_an_encoding_error() {
        assert!(matches!(
            payload_value(&Unserializable),
            Err(TraceError::Encoding(_))
        ));
        assert!(matches!(
            encode_payload(&Unserializable),
            Err(TraceError::Encoding(_))
        ));
    }

    #[test]
    fn non_string_map_keys_are_an_encoding_error() {
        let mut bad = HashMap::new();
        bad.insert((1_u8, 2_u8), "value");
        assert!(matches!(
            encode_payload(&bad),
            Err(TraceError::Encoding(_))
        ));
    }

    #[test]
    fn unknown_actor_tags_decode_as_anonymous() {
        assert_eq!(decode_actor("robot"), ActorKind::Anonymous);
        assert_eq!(decode_actor("admin"), ActorKind::Admin);
    }
}
