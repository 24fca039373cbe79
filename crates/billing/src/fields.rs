//! Helpers for pulling typed fields out of gateway JSON.
//!
//! Frisbii objects are loosely typed; every mapping in the sync services goes
//! through these so missing or oddly-typed fields degrade to `None` instead of
//! failing the sync.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub(crate) fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn i64_field(object: &Value, key: &str) -> Option<i64> {
    object.get(key).and_then(Value::as_i64)
}

pub(crate) fn i32_field(object: &Value, key: &str) -> Option<i32> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

/// Parse an ISO-8601 timestamp field. Frisbii emits RFC 3339 strings.
pub(crate) fn ts_field(object: &Value, key: &str) -> Option<OffsetDateTime> {
    object
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ts_field_parses_rfc3339() {
        let object = json!({"created": "2026-01-15T10:30:00Z"});
        let ts = ts_field(&object, "created").unwrap();
        assert_eq!(ts.year(), 2026);
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn missing_or_invalid_fields_are_none() {
        let object = json!({"created": "not-a-date", "amount": "1000"});
        assert!(ts_field(&object, "created").is_none());
        assert!(ts_field(&object, "absent").is_none());
        assert!(i64_field(&object, "amount").is_none());
        assert!(str_field(&object, "absent").is_none());
    }
}
