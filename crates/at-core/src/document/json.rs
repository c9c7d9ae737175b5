//! JSON document encoding: `{"auditLog":[event, ...]}`

use at_common::ChangeEvent;
use serde::{Deserialize, Serialize};

use super::DocumentError;

#[derive(Serialize)]
struct JsonDocumentRef<'a> {
    #[serde(rename = "auditLog")]
    audit_log: &'a [ChangeEvent],
}

#[derive(Deserialize)]
struct JsonDocument {
    #[serde(rename = "auditLog")]
    audit_log: Vec<ChangeEvent>,
}

pub(super) fn encode(events: &[ChangeEvent]) -> Result<String, DocumentError> {
    serde_json::to_string(&JsonDocumentRef { audit_log: events })
        .map_err(|e| DocumentError::Encode(e.to_string()))
}

pub(super) fn decode(text: &str) -> Result<Vec<ChangeEvent>, DocumentError> {
    let text = text.trim_start_matches('\u{feff}');
    let document: JsonDocument = serde_json::from_str(text)?;
    Ok(document.audit_log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_common::{AuditAction, FieldChange};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_encoded_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        let events = vec![ChangeEvent::new(AuditAction::Updated, "admin", ts).with_fields(vec![
            FieldChange::diff("Price", Some("9.99".into()), Some("12.99".into())),
        ])];

        assert_eq!(
            encode(&events).unwrap(),
            r#"{"auditLog":[{"action":"Updated","user":"admin","timestamp":"2024-12-11T10:30:00Z","fields":[{"name":"Price","before":"9.99","after":"12.99"}]}]}"#
        );
    }

    #[test]
    fn test_decode_ignores_unknown_members() {
        let text = r#"{"auditLog":[{"action":"Deleted","user":"bob","timestamp":"2024-12-11T10:30:00.250Z","extra":1}],"version":2}"#;
        let events = decode(text).unwrap();
        assert_eq!(events[0].action, AuditAction::Deleted);
        assert!(events[0].fields.is_empty());
        assert_eq!(events[0].timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_decode_requires_audit_log() {
        assert!(decode(r#"{"events":[]}"#).is_err());
    }
}
