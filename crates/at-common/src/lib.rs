use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

pub mod logging;
pub mod timestamp;

/// Maximum length of a `SourceType` display name in the reference schema.
pub const MAX_SOURCE_TYPE_LEN: usize = 50;

/// Maximum length of a stringified `SourceKey` (composite keys are concatenated).
pub const MAX_SOURCE_KEY_LEN: usize = 900;

// ============================================================================
// Change Events
// ============================================================================

/// Action recorded by a change event.
///
/// `Created`, `Updated` and `Deleted` describe the audited entity itself;
/// `Added`, `Updated` and `Removed` describe related child entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
    Added,
    Removed,
}

impl AuditAction {
    pub const ALL: [AuditAction; 5] = [
        AuditAction::Created,
        AuditAction::Updated,
        AuditAction::Deleted,
        AuditAction::Added,
        AuditAction::Removed,
    ];

    /// Wire name, identical in the JSON and XML encodings
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "Created",
            AuditAction::Updated => "Updated",
            AuditAction::Deleted => "Deleted",
            AuditAction::Added => "Added",
            AuditAction::Removed => "Removed",
        }
    }

    /// Whether this action uses capture-style fields (`value`) rather than diffs
    pub fn is_capture(&self) -> bool {
        matches!(self, AuditAction::Added | AuditAction::Removed)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown audit action: {0}")]
pub struct UnknownActionError(pub String);

impl FromStr for AuditAction {
    type Err = UnknownActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownActionError(s.to_string()))
    }
}

/// One property's change.
///
/// Diff-style changes (Updated) carry `before`/`after`; capture-style changes
/// (Added/Removed and lookups) carry `value`. Absent values are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldChange {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FieldChange {
    /// Diff-style change of a property between two snapshots
    pub fn diff(name: impl Into<String>, before: Option<String>, after: Option<String>) -> Self {
        Self {
            name: name.into(),
            before,
            after,
            value: None,
        }
    }

    /// Capture-style value of a property from a single snapshot
    pub fn captured(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
            value,
        }
    }

    pub fn is_capture(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// A single recorded action on an audited entity.
///
/// Serializes to the JSON wire shape used inside audit documents:
/// `{"action":"Updated","user":"admin","timestamp":"...","related":"...","fields":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: AuditAction,

    /// Actor who performed the change
    #[serde(rename = "user")]
    pub actor: String,

    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Related type name, set only for events raised by a related entity
    #[serde(rename = "related", default, skip_serializing_if = "Option::is_none")]
    pub related_type: Option<String>,

    #[serde(default)]
    pub fields: Vec<FieldChange>,
}

impl ChangeEvent {
    pub fn new(action: AuditAction, actor: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            action,
            actor: actor.into(),
            timestamp,
            related_type: None,
            fields: Vec::new(),
        }
    }

    pub fn with_related(mut self, related_type: impl Into<String>) -> Self {
        self.related_type = Some(related_type.into());
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldChange>) -> Self {
        self.fields = fields;
        self
    }

    /// Look up a field change by property name
    pub fn field(&self, name: &str) -> Option<&FieldChange> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Format the event for human-readable output
    pub fn format_human_readable(&self) -> String {
        let mut output = format!(
            "[{}] {} by {}",
            timestamp::format(&self.timestamp),
            self.action,
            self.actor
        );

        if let Some(related) = &self.related_type {
            output.push_str(&format!(" ({})", related));
        }

        for field in &self.fields {
            if field.is_capture() {
                output.push_str(&format!(
                    "\n  {} = {}",
                    field.name,
                    field.value.as_deref().unwrap_or("<null>")
                ));
            } else {
                output.push_str(&format!(
                    "\n  {}: {} -> {}",
                    field.name,
                    field.before.as_deref().unwrap_or("<null>"),
                    field.after.as_deref().unwrap_or("<null>")
                ));
            }
        }

        output
    }
}

// ============================================================================
// Aggregate Identity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Source type must not be empty")]
    EmptySourceType,

    #[error("Source key must not be empty for source type {source_type}")]
    EmptySourceKey { source_type: String },

    #[error("Source type '{source_type}' is {len} characters, maximum is {max}")]
    SourceTypeTooLong { source_type: String, len: usize, max: usize },

    #[error("Source key for {source_type} is {len} characters, maximum is {max}")]
    SourceKeyTooLong { source_type: String, len: usize, max: usize },
}

/// `(SourceType, SourceKey)` pair identifying one audited entity instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIdentity {
    pub source_type: String,
    pub source_key: String,
}

impl AuditIdentity {
    pub fn new(source_type: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            source_key: source_key.into(),
        }
    }

    /// Check the identity against the persisted column limits
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.source_type.is_empty() {
            return Err(IdentityError::EmptySourceType);
        }
        let type_len = self.source_type.chars().count();
        if type_len > MAX_SOURCE_TYPE_LEN {
            return Err(IdentityError::SourceTypeTooLong {
                source_type: self.source_type.clone(),
                len: type_len,
                max: MAX_SOURCE_TYPE_LEN,
            });
        }
        if self.source_key.is_empty() {
            return Err(IdentityError::EmptySourceKey {
                source_type: self.source_type.clone(),
            });
        }
        let key_len = self.source_key.chars().count();
        if key_len > MAX_SOURCE_KEY_LEN {
            return Err(IdentityError::SourceKeyTooLong {
                source_type: self.source_type.clone(),
                len: key_len,
                max: MAX_SOURCE_KEY_LEN,
            });
        }
        Ok(())
    }
}

impl fmt::Display for AuditIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_type, self.source_key)
    }
}

// ============================================================================
// Read-back Types
// ============================================================================

/// A decoded audit document together with its row metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub log_id: String,
    pub source_type: String,
    pub source_key: String,
    pub events: Vec<ChangeEvent>,
}

impl AuditLogEntry {
    pub fn identity(&self) -> AuditIdentity {
        AuditIdentity::new(self.source_type.clone(), self.source_key.clone())
    }

    /// The array-position-last event
    pub fn last_event(&self) -> Option<&ChangeEvent> {
        self.events.last()
    }
}

/// One row of the "last event per entity" projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub source_type: String,
    pub source_key: String,
    pub last_action: Option<AuditAction>,
    #[serde(with = "timestamp::option")]
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_actor: Option<String>,
}

// ============================================================================
// Document Format
// ============================================================================

/// Configuration-wide textual encoding of audit documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Json,
    Xml,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Json => "json",
            DocumentFormat::Xml => "xml",
        }
    }

    /// Guess the encoding of stored text from its first significant character
    pub fn detect(text: &str) -> Option<Self> {
        match text.trim_start_matches('\u{feff}').trim_start().chars().next() {
            Some('{') => Some(DocumentFormat::Json),
            Some('<') => Some(DocumentFormat::Xml),
            _ => None,
        }
    }
}

impl Default for DocumentFormat {
    fn default() -> Self {
        DocumentFormat::Json
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(DocumentFormat::Json),
            "xml" => Ok(DocumentFormat::Xml),
            other => Err(format!("Unknown document format: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_action_round_trips_through_str() {
        for action in AuditAction::ALL {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert_eq!("deleted".parse::<AuditAction>().unwrap(), AuditAction::Deleted);
        assert!("Archived".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_change_event_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        let event = ChangeEvent::new(AuditAction::Updated, "admin", ts).with_fields(vec![
            FieldChange::diff("Price", Some("9.99".into()), Some("12.99".into())),
        ]);

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"action":"Updated","user":"admin","timestamp":"2024-12-11T10:30:00Z","fields":[{"name":"Price","before":"9.99","after":"12.99"}]}"#
        );
    }

    #[test]
    fn test_related_event_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        let event = ChangeEvent::new(AuditAction::Added, "admin", ts)
            .with_related("ProductTag")
            .with_fields(vec![FieldChange::captured("Tag", Some("Gaming".into()))]);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["related"], "ProductTag");
        assert_eq!(json["fields"][0]["value"], "Gaming");
        assert!(json["fields"][0].get("before").is_none());
    }

    #[test]
    fn test_identity_validation() {
        assert!(AuditIdentity::new("Product", "42").validate().is_ok());
        assert_eq!(
            AuditIdentity::new("", "42").validate(),
            Err(IdentityError::EmptySourceType)
        );
        let long_type = "T".repeat(MAX_SOURCE_TYPE_LEN + 1);
        assert!(matches!(
            AuditIdentity::new(long_type, "1").validate(),
            Err(IdentityError::SourceTypeTooLong { .. })
        ));
        let long_key = "k".repeat(MAX_SOURCE_KEY_LEN + 1);
        assert!(matches!(
            AuditIdentity::new("Product", long_key).validate(),
            Err(IdentityError::SourceKeyTooLong { .. })
        ));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(AuditIdentity::new("Product", "42").to_string(), "Product#42");
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(DocumentFormat::detect(r#"{"auditLog":[]}"#), Some(DocumentFormat::Json));
        assert_eq!(DocumentFormat::detect("  <AuditLog/>"), Some(DocumentFormat::Xml));
        assert_eq!(DocumentFormat::detect(""), None);
    }

    #[test]
    fn test_human_readable_format() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        let event = ChangeEvent::new(AuditAction::Updated, "admin", ts).with_fields(vec![
            FieldChange::diff("Stock", Some("100".into()), Some("95".into())),
        ]);
        let text = event.format_human_readable();
        assert!(text.contains("Updated by admin"));
        assert!(text.contains("Stock: 100 -> 95"));
    }
}
