//! Audit Log Store
//!
//! Reads and writes whole audit documents through an [`AuditWriter`] and
//! resolves the insert race between two writers creating the first document
//! for the same entity: the loser re-reads the winner's row and merges into
//! it, up to `max_insert_retries` times.

use at_common::{AuditIdentity, ChangeEvent, DocumentFormat};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::document::{AuditDocument, DocumentCodec};
use crate::error::{AuditError, Result};
use crate::repository::{AuditWriter, InsertOutcome};

/// Default bound on lost insert races per append
pub const DEFAULT_MAX_INSERT_RETRIES: u32 = 3;

/// What `append` or `save` did to the row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub log_id: String,
    /// The row was created by this write
    pub created: bool,
    /// Events in the document after the write
    pub total_events: usize,
    /// Insert races lost before succeeding
    pub lost_races: u32,
}

#[derive(Debug, Clone)]
pub struct AuditLogStore {
    codec: DocumentCodec,
    max_insert_retries: u32,
}

impl AuditLogStore {
    pub fn new(format: DocumentFormat, max_insert_retries: u32) -> Self {
        Self {
            codec: DocumentCodec::new(format),
            max_insert_retries,
        }
    }

    pub fn codec(&self) -> &DocumentCodec {
        &self.codec
    }

    pub fn max_insert_retries(&self) -> u32 {
        self.max_insert_retries
    }

    /// Current document for an identity
    pub async fn fetch<W>(&self, writer: &mut W, identity: &AuditIdentity) -> Result<Option<AuditDocument>>
    where
        W: AuditWriter + ?Sized,
    {
        match writer.fetch_document(identity).await? {
            Some(row) => Ok(Some(self.codec.decode(&row.document)?)),
            None => Ok(None),
        }
    }

    /// Write a whole document, inserting the row or replacing its document
    ///
    /// `document` must extend the stored one: every stored event has to be
    /// its prefix, otherwise `StaleDocument` is returned. When another writer
    /// creates the row first, the events of `document` are appended after the
    /// winner's.
    pub async fn save<W>(
        &self,
        writer: &mut W,
        identity: &AuditIdentity,
        document: &AuditDocument,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome>
    where
        W: AuditWriter + ?Sized,
    {
        identity.validate()?;

        let existing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            row = writer.fetch_document(identity) => row?,
        };

        if let Some(row) = existing {
            let stored = self.codec.decode(&row.document)?;
            if !document.events().starts_with(stored.events()) {
                return Err(AuditError::StaleDocument {
                    identity: identity.to_string(),
                    stored: stored.len(),
                });
            }
            self.update(writer, &row.log_id, document, cancel).await?;
            debug!(identity = %identity, total = document.len(), "Saved audit document");
            return Ok(AppendOutcome {
                log_id: row.log_id,
                created: false,
                total_events: document.len(),
                lost_races: 0,
            });
        }

        if let Some(log_id) = self.insert(writer, identity, document, 0, cancel).await? {
            return Ok(AppendOutcome {
                log_id,
                created: true,
                total_events: document.len(),
                lost_races: 0,
            });
        }
        self.append_from(writer, identity, document.events(), 1, cancel).await
    }

    /// Append events in order to the identity's document, creating it if needed
    pub async fn append<W>(
        &self,
        writer: &mut W,
        identity: &AuditIdentity,
        events: &[ChangeEvent],
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome>
    where
        W: AuditWriter + ?Sized,
    {
        identity.validate()?;
        self.append_from(writer, identity, events, 0, cancel).await
    }

    async fn append_from<W>(
        &self,
        writer: &mut W,
        identity: &AuditIdentity,
        events: &[ChangeEvent],
        first_attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome>
    where
        W: AuditWriter + ?Sized,
    {
        for attempt in first_attempt..=self.max_insert_retries {
            let existing = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuditError::Cancelled),
                row = writer.fetch_document(identity) => row?,
            };

            if let Some(row) = existing {
                let mut document = self.codec.decode(&row.document)?;
                for event in events {
                    document.push(event.clone());
                }
                self.update(writer, &row.log_id, &document, cancel).await?;
                debug!(identity = %identity, events = events.len(), total = document.len(), "Appended to audit document");
                return Ok(AppendOutcome {
                    log_id: row.log_id,
                    created: false,
                    total_events: document.len(),
                    lost_races: attempt,
                });
            }

            let document = AuditDocument::from_events(events.to_vec());
            if let Some(log_id) = self.insert(writer, identity, &document, attempt, cancel).await? {
                return Ok(AppendOutcome {
                    log_id,
                    created: true,
                    total_events: document.len(),
                    lost_races: attempt,
                });
            }
        }

        Err(AuditError::InsertConflict {
            identity: identity.to_string(),
            attempts: self.max_insert_retries + 1,
        })
    }

    async fn update<W>(
        &self,
        writer: &mut W,
        log_id: &str,
        document: &AuditDocument,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AuditWriter + ?Sized,
    {
        let text = self.codec.encode(document)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuditError::Cancelled),
            done = writer.update_document(log_id, &text) => Ok(done?),
        }
    }

    /// Insert the first document; `None` when another writer got there first
    async fn insert<W>(
        &self,
        writer: &mut W,
        identity: &AuditIdentity,
        document: &AuditDocument,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>
    where
        W: AuditWriter + ?Sized,
    {
        let text = self.codec.encode(document)?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            outcome = writer.insert_document(identity, &text) => outcome?,
        };

        match outcome {
            InsertOutcome::Inserted { log_id } => {
                debug!(identity = %identity, log_id = %log_id, events = document.len(), "Created audit document");
                Ok(Some(log_id))
            }
            InsertOutcome::AlreadyExists => {
                warn!(
                    identity = %identity,
                    attempt = attempt + 1,
                    max = self.max_insert_retries,
                    "Lost insert race for audit document, retrying as update"
                );
                Ok(None)
            }
        }
    }
}

impl Default for AuditLogStore {
    fn default() -> Self {
        Self::new(DocumentFormat::Json, DEFAULT_MAX_INSERT_RETRIES)
    }
}
