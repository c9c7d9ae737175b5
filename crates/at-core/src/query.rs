//! Audit Query Service
//!
//! Read-side API over stored documents. Filtering is pushed down to the
//! store through [`DocumentFilter`]; the last-event summary is a projection
//! the store computes without returning whole documents where it can.

use std::sync::Arc;

use at_common::{AuditAction, AuditIdentity, AuditLogEntry, AuditSummary};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::context::{Clock, SystemClock};
use crate::document::DocumentCodec;
use crate::error::{AuditError, Result};
use crate::repository::{AuditReader, DocumentFilter, StoredDocument};

pub struct AuditQueryService {
    reader: Arc<dyn AuditReader>,
    codec: DocumentCodec,
    clock: Arc<dyn Clock>,
}

impl AuditQueryService {
    pub fn new(reader: Arc<dyn AuditReader>, codec: DocumentCodec) -> Self {
        Self {
            reader,
            codec,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the default upper bound of date-range queries
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Documents of one source type, ordered by source key
    pub async fn get_logs_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditLogEntry>> {
        if take == 0 {
            return Ok(Vec::new());
        }
        let rows = self.reader.list_by_type(source_type, skip, take).await?;
        self.decode_all(rows)
    }

    /// The document of one entity, or `None` if it has no history
    pub async fn get_log(&self, source_type: &str, source_key: &str) -> Result<Option<AuditLogEntry>> {
        let identity = AuditIdentity::new(source_type, source_key);
        match self.reader.get_by_identity(&identity).await? {
            Some(row) => Ok(Some(self.decode(row)?)),
            None => Ok(None),
        }
    }

    /// Documents containing at least one event with `action`
    pub async fn get_logs_by_action(&self, source_type: &str, action: AuditAction) -> Result<Vec<AuditLogEntry>> {
        self.matching(source_type, DocumentFilter::has_action(action)).await
    }

    /// Documents containing at least one event in `[from, to]`; `to` defaults to now
    pub async fn get_logs_by_date_range(
        &self,
        source_type: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditLogEntry>> {
        let to = self.upper_bound(from, to)?;
        self.matching(source_type, DocumentFilter::timestamp_in_range(from, to))
            .await
    }

    /// Documents satisfying both predicates, not necessarily on the same event
    pub async fn get_logs_by_action_and_date_range(
        &self,
        source_type: &str,
        action: AuditAction,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditLogEntry>> {
        let to = self.upper_bound(from, to)?;
        let filter = DocumentFilter::has_action(action).and_range(from, to);
        self.matching(source_type, filter).await
    }

    /// Last event of each document, ordered by source key
    pub async fn get_audit_summary(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>> {
        if take == 0 {
            return Ok(Vec::new());
        }
        Ok(self.reader.summarize(source_type, skip, take).await?)
    }

    async fn matching(&self, source_type: &str, filter: DocumentFilter) -> Result<Vec<AuditLogEntry>> {
        let rows = self.reader.list_matching(source_type, &filter).await?;
        debug!(source_type, ?filter, matched = rows.len(), "Filtered audit documents");
        self.decode_all(rows)
    }

    fn upper_bound(&self, from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let to = to.unwrap_or_else(|| self.clock.now());
        if from > to {
            return Err(AuditError::invalid_query(format!(
                "date range starts at {} after it ends at {}",
                at_common::timestamp::format(&from),
                at_common::timestamp::format(&to)
            )));
        }
        Ok(to)
    }

    fn decode_all(&self, rows: Vec<StoredDocument>) -> Result<Vec<AuditLogEntry>> {
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    fn decode(&self, row: StoredDocument) -> Result<AuditLogEntry> {
        let document = self.codec.decode(&row.document)?;
        Ok(AuditLogEntry {
            log_id: row.log_id,
            source_type: row.identity.source_type,
            source_key: row.identity.source_key,
            events: document.into_events(),
        })
    }
}
