//! XML document encoding
//!
//! ```xml
//! <AuditLog>
//!   <Entry Action="Updated" User="admin" Timestamp="2024-12-11T10:30:00Z">
//!     <Field Name="Price" Before="9.99" After="12.99"/>
//!   </Entry>
//! </AuditLog>
//! ```
//!
//! Documents are read with `roxmltree`, so declarations, comments, either
//! quote style and explicit end tags are all accepted. Unknown attributes are
//! ignored; text content and unknown elements are errors.

use std::fmt::Write as _;

use at_common::{timestamp, AuditAction, ChangeEvent, FieldChange};
use roxmltree::{Document, Node};

use super::DocumentError;

const ROOT: &str = "AuditLog";
const ENTRY: &str = "Entry";
const FIELD: &str = "Field";

// ============================================================================
// Writer
// ============================================================================

pub(super) fn encode(events: &[ChangeEvent]) -> Result<String, DocumentError> {
    if events.is_empty() {
        return Ok(format!("<{}/>", ROOT));
    }

    let mut out = String::with_capacity(64 + events.len() * 128);
    out.push('<');
    out.push_str(ROOT);
    out.push('>');

    for event in events {
        out.push('<');
        out.push_str(ENTRY);
        write_attr(&mut out, "Action", event.action.as_str())?;
        write_attr(&mut out, "User", &event.actor)?;
        write_attr(&mut out, "Timestamp", &timestamp::format(&event.timestamp))?;
        if let Some(related) = &event.related_type {
            write_attr(&mut out, "Related", related)?;
        }

        if event.fields.is_empty() {
            out.push_str("/>");
            continue;
        }
        out.push('>');
        for field in &event.fields {
            out.push('<');
            out.push_str(FIELD);
            write_attr(&mut out, "Name", &field.name)?;
            if let Some(before) = &field.before {
                write_attr(&mut out, "Before", before)?;
            }
            if let Some(after) = &field.after {
                write_attr(&mut out, "After", after)?;
            }
            if let Some(value) = &field.value {
                write_attr(&mut out, "Value", value)?;
            }
            out.push_str("/>");
        }
        out.push_str("</");
        out.push_str(ENTRY);
        out.push('>');
    }

    out.push_str("</");
    out.push_str(ROOT);
    out.push('>');
    Ok(out)
}

fn write_attr(out: &mut String, name: &str, value: &str) -> Result<(), DocumentError> {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Attribute-value normalization would turn raw whitespace into spaces
            '\t' | '\n' | '\r' => {
                let _ = write!(out, "&#{};", c as u32);
            }
            c if is_xml_char(c) => out.push(c),
            c => {
                return Err(DocumentError::Encode(format!(
                    "attribute {} contains U+{:04X}, which XML 1.0 cannot represent",
                    name, c as u32
                )))
            }
        }
    }
    out.push('"');
    Ok(())
}

fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

// ============================================================================
// Reader
// ============================================================================

pub(super) fn decode(text: &str) -> Result<Vec<ChangeEvent>, DocumentError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let doc = Document::parse(text).map_err(|e| DocumentError::Xml(e.to_string()))?;

    let root = doc.root_element();
    if root.tag_name().name() != ROOT {
        return Err(malformed(format!(
            "expected <{}>, found <{}>",
            ROOT,
            root.tag_name().name()
        )));
    }

    children(root, ENTRY)?.into_iter().map(read_entry).collect()
}

/// Resolve entity and character references in attribute text
pub fn unescape(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let wrapped = format!("<v a=\"{}\"/>", raw);
    let doc = Document::parse(&wrapped).map_err(|e| format!("'{}': {}", raw, e))?;
    Ok(doc.root_element().attribute("a").unwrap_or_default().to_string())
}

fn malformed(message: impl Into<String>) -> DocumentError {
    DocumentError::Xml(message.into())
}

/// Element children of `parent`, all of which must be `<expected>`
fn children<'a, 'input>(parent: Node<'a, 'input>, expected: &str) -> Result<Vec<Node<'a, 'input>>, DocumentError> {
    let mut elements = Vec::new();
    for child in parent.children() {
        if child.is_element() {
            if child.tag_name().name() != expected {
                return Err(malformed(format!(
                    "unexpected <{}> inside <{}>",
                    child.tag_name().name(),
                    parent.tag_name().name()
                )));
            }
            elements.push(child);
        } else if child.is_text() && !child.text().unwrap_or_default().trim().is_empty() {
            return Err(malformed(format!("unexpected text inside <{}>", parent.tag_name().name())));
        }
    }
    Ok(elements)
}

fn required<'a>(node: Node<'a, '_>, attr: &str) -> Result<&'a str, DocumentError> {
    node.attribute(attr)
        .ok_or_else(|| malformed(format!("<{}> is missing {}", node.tag_name().name(), attr)))
}

fn read_entry(entry: Node<'_, '_>) -> Result<ChangeEvent, DocumentError> {
    let action: AuditAction = required(entry, "Action")?
        .parse()
        .map_err(|e| malformed(format!("{}", e)))?;
    let actor = required(entry, "User")?;
    let ts = required(entry, "Timestamp")?;
    let ts = timestamp::parse(ts).map_err(|e| malformed(format!("bad Timestamp '{}': {}", ts, e)))?;

    let mut event = ChangeEvent::new(action, actor, ts);
    event.related_type = entry.attribute("Related").map(String::from);

    for field in children(entry, FIELD)? {
        if !children(field, FIELD)?.is_empty() {
            return Err(malformed("<Field> must not have children"));
        }
        event.fields.push(FieldChange {
            name: required(field, "Name")?.to_string(),
            before: field.attribute("Before").map(String::from),
            after: field.attribute("After").map(String::from),
            value: field.attribute("Value").map(String::from),
        });
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_encoded_shape() {
        let events = vec![
            ChangeEvent::new(AuditAction::Updated, "admin", ts()).with_fields(vec![
                FieldChange::diff("Price", Some("9.99".into()), Some("12.99".into())),
            ]),
            ChangeEvent::new(AuditAction::Deleted, "admin", ts()),
        ];
        assert_eq!(
            encode(&events).unwrap(),
            concat!(
                r#"<AuditLog><Entry Action="Updated" User="admin" Timestamp="2024-12-11T10:30:00Z">"#,
                r#"<Field Name="Price" Before="9.99" After="12.99"/></Entry>"#,
                r#"<Entry Action="Deleted" User="admin" Timestamp="2024-12-11T10:30:00Z"/></AuditLog>"#
            )
        );
        assert_eq!(encode(&[]).unwrap(), "<AuditLog/>");
    }

    #[test]
    fn test_special_characters_round_trip() {
        let value = "Tom & \"Jerry\" <'x'>\ttab\r\nline ünïcødé 🚀";
        let events = vec![ChangeEvent::new(AuditAction::Added, "o'brien", ts())
            .with_related("Note")
            .with_fields(vec![FieldChange::captured("Text", Some(value.into()))])];

        let decoded = decode(&encode(&events).unwrap()).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_unrepresentable_character_is_an_encode_error() {
        let events = vec![ChangeEvent::new(AuditAction::Added, "admin", ts())
            .with_fields(vec![FieldChange::captured("Bell", Some("\u{7}".into()))])];
        assert!(matches!(encode(&events), Err(DocumentError::Encode(_))));
    }

    #[test]
    fn test_reader_tolerates_formatting() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
            <!-- written by hand -->
            <AuditLog>
              <Entry Timestamp='2024-12-11T12:30:00+02:00' Action='Created' User='admin' Source='import'>
                <Field Name="Name" Value="Laptop"></Field>
              </Entry>
            </AuditLog>
        "#;
        let events = decode(text).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, ts());
        assert_eq!(events[0].action, AuditAction::Created);
        assert_eq!(events[0].fields[0].value.as_deref(), Some("Laptop"));
    }

    #[test]
    fn test_reader_rejects_malformed_documents() {
        assert!(decode("<AuditLog>").is_err());
        assert!(decode("<Audit/>").is_err());
        assert!(decode("<AuditLog><Entry Action=\"Created\" User=\"a\"/></AuditLog>").is_err());
        assert!(decode("<AuditLog>text</AuditLog>").is_err());
        assert!(decode("<AuditLog/><AuditLog/>").is_err());
        assert!(decode(r#"<AuditLog><Entry Action="Archived" User="a" Timestamp="2024-12-11T10:30:00Z"/></AuditLog>"#).is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a &amp; b &#60; &#x3E;").unwrap(), "a & b < >");
        assert!(unescape("&bogus;").is_err());
        assert!(unescape("&amp").is_err());
    }
}
