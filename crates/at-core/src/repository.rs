//! Audit Repository Traits
//!
//! The seams between the engine and a backing store. One row per audited
//! entity: `(log_id, source_type, source_key, document)` with a unique index
//! on `(source_type, source_key)`.
//!
//! Writers run inside the caller's transaction and take `&mut self`; readers
//! are shared and run outside any unit of work.

use async_trait::async_trait;
use anyhow::Result;
use at_common::{AuditAction, AuditIdentity, AuditSummary, ChangeEvent};
use chrono::{DateTime, Utc};

use crate::error::AuditError;

/// Configuration for the audit table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTableConfig {
    /// Table (or collection) name (default: "audit_logs")
    pub table: String,
    /// Optional schema qualifying the table
    pub schema: Option<String>,
}

impl Default for AuditTableConfig {
    fn default() -> Self {
        Self {
            table: "audit_logs".to_string(),
            schema: None,
        }
    }
}

impl AuditTableConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        self.schema = (!schema.is_empty()).then_some(schema);
        self
    }

    /// `schema.table` or just `table`
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }

    /// Name of the unique `(source_type, source_key)` index
    pub fn identity_index(&self) -> String {
        format!("ux_{}_identity", self.table)
    }

    /// Name of the non-unique `source_type` index
    pub fn source_type_index(&self) -> String {
        format!("ix_{}_source_type", self.table)
    }
}

/// A stored audit row with its document still encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub log_id: String,
    pub identity: AuditIdentity,
    pub document: String,
}

/// Result of an insert attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { log_id: String },
    /// Another writer inserted the same identity first
    AlreadyExists,
}

/// Row access inside a unit of work
#[async_trait]
pub trait AuditWriter: Send {
    /// Fetch the row for an identity, if any
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> Result<Option<StoredDocument>>;

    /// Insert a new row; a uniqueness violation is reported as `AlreadyExists`
    async fn insert_document(&mut self, identity: &AuditIdentity, document: &str) -> Result<InsertOutcome>;

    /// Replace the document of an existing row
    async fn update_document(&mut self, log_id: &str, document: &str) -> Result<()>;
}

/// A writer bound to a transaction that can be committed or rolled back
///
/// Dropping the writer without committing rolls the transaction back.
#[async_trait]
pub trait TransactionalWriter: AuditWriter + Sized {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Document-level predicates pushed down to the store
///
/// Both predicates must hold when both are set, but not necessarily on the
/// same event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    /// Some event has this action
    pub action: Option<AuditAction>,
    /// Some event's timestamp is within `[from, to]`
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl DocumentFilter {
    pub fn has_action(action: AuditAction) -> Self {
        Self {
            action: Some(action),
            range: None,
        }
    }

    pub fn timestamp_in_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            action: None,
            range: Some((from, to)),
        }
    }

    pub fn and_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn and_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.range = Some((from, to));
        self
    }

    /// Evaluate in process, for stores that cannot look inside documents
    pub fn matches(&self, events: &[ChangeEvent]) -> bool {
        let action_ok = self
            .action
            .map_or(true, |a| events.iter().any(|e| e.action == a));
        let range_ok = self.range.map_or(true, |(from, to)| {
            events.iter().any(|e| e.timestamp >= from && e.timestamp <= to)
        });
        action_ok && range_ok
    }
}

/// Read access for the query engine
#[async_trait]
pub trait AuditReader: Send + Sync {
    /// Rows of one source type ordered by source key, paged
    async fn list_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<StoredDocument>>;

    /// The row for one identity
    async fn get_by_identity(&self, identity: &AuditIdentity) -> Result<Option<StoredDocument>>;

    /// Rows of one source type whose documents satisfy `filter`, ordered by source key
    async fn list_matching(&self, source_type: &str, filter: &DocumentFilter) -> Result<Vec<StoredDocument>>;

    /// Last event of each row of one source type, ordered by source key, paged
    async fn summarize(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>>;
}

/// Creation and inspection of the audit table
#[async_trait]
pub trait SchemaManager: Send + Sync {
    fn table_config(&self) -> &AuditTableConfig;

    /// Create the table and its indexes if they do not exist
    async fn init_schema(&self) -> Result<()>;

    async fn schema_exists(&self) -> Result<bool>;

    /// DDL an operator can run to provision the table by hand
    fn provisioning_statement(&self) -> String;

    /// Any one stored document, used to check the configured format
    async fn sample_document(&self) -> Result<Option<String>>;
}

/// Make sure the audit table exists and holds documents in `codec`'s format
///
/// With auto-provisioning off a missing table fails with the DDL to run.
pub async fn ensure_schema(
    manager: &dyn SchemaManager,
    auto_provision: bool,
    codec: &crate::document::DocumentCodec,
) -> Result<(), AuditError> {
    if !manager.schema_exists().await? {
        if !auto_provision {
            return Err(AuditError::SchemaMissing {
                table: manager.table_config().qualified_name(),
                statement: manager.provisioning_statement(),
            });
        }
        tracing::info!(table = %manager.table_config().qualified_name(), "Provisioning audit table");
        manager.init_schema().await?;
        return Ok(());
    }

    if let Some(sample) = manager.sample_document().await? {
        codec.check_format(&sample)?;
    }
    Ok(())
}
