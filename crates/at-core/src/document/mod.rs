//! Audit documents
//!
//! One document per audited entity holds its complete, ordered event history.
//! The codec encodes it as JSON (`{"auditLog":[...]}`) or XML
//! (`<AuditLog><Entry .../></AuditLog>`) and appends new events by
//! decode-append-encode. Prior events are never touched.

mod json;
mod xml;

use at_common::{ChangeEvent, DocumentFormat};
use thiserror::Error;

pub use xml::unescape as unescape_xml;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Malformed JSON audit document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed XML audit document: {0}")]
    Xml(String),

    #[error("Stored audit document is {found} but the configured format is {expected}")]
    FormatMismatch {
        expected: DocumentFormat,
        found: DocumentFormat,
    },

    #[error("Stored audit document is neither JSON nor XML")]
    UnknownFormat,

    #[error("Cannot encode audit document: {0}")]
    Encode(String),
}

impl DocumentError {
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, DocumentError::FormatMismatch { .. })
    }
}

/// Ordered event history of one audited entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditDocument {
    events: Vec<ChangeEvent>,
}

impl AuditDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.events
    }

    /// The array-position-last event
    pub fn last(&self) -> Option<&ChangeEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Encodes, decodes and merges audit documents in one configured format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentCodec {
    format: DocumentFormat,
}

impl DocumentCodec {
    pub fn new(format: DocumentFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    pub fn encode(&self, document: &AuditDocument) -> Result<String, DocumentError> {
        match self.format {
            DocumentFormat::Json => json::encode(document.events()),
            DocumentFormat::Xml => xml::encode(document.events()),
        }
    }

    /// Decode stored text, rejecting documents written in the other format
    pub fn decode(&self, text: &str) -> Result<AuditDocument, DocumentError> {
        self.check_format(text)?;
        let events = match self.format {
            DocumentFormat::Json => json::decode(text)?,
            DocumentFormat::Xml => xml::decode(text)?,
        };
        Ok(AuditDocument::from_events(events))
    }

    /// Append one event to an existing document, or start a new one
    pub fn merge(&self, existing: Option<&str>, event: ChangeEvent) -> Result<String, DocumentError> {
        self.merge_all(existing, std::iter::once(event))
    }

    /// Append events in order to an existing document, or start a new one
    ///
    /// Blank existing text is treated as no document.
    pub fn merge_all<I>(&self, existing: Option<&str>, events: I) -> Result<String, DocumentError>
    where
        I: IntoIterator<Item = ChangeEvent>,
    {
        let mut document = match existing {
            Some(text) if !text.trim().is_empty() => self.decode(text)?,
            _ => AuditDocument::new(),
        };
        for event in events {
            document.push(event);
        }
        self.encode(&document)
    }

    /// Fail with `FormatMismatch` when `text` is recognizably the other format
    pub fn check_format(&self, text: &str) -> Result<(), DocumentError> {
        match DocumentFormat::detect(text) {
            Some(found) if found == self.format => Ok(()),
            Some(found) => Err(DocumentError::FormatMismatch {
                expected: self.format,
                found,
            }),
            None => Err(DocumentError::UnknownFormat),
        }
    }
}
