//! PostgreSQL Audit Storage
//!
//! Documents live in a TEXT column so both formats share one table layout.
//! Filters and summaries are pushed down: JSON through `jsonb` operators,
//! XML through `xpath`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use at_common::{AuditIdentity, AuditSummary, DocumentFormat};
use at_core::document::unescape_xml;
use at_core::{
    AuditReader, AuditTableConfig, AuditUnitOfWork, AuditWriter, DocumentCodec, DocumentFilter,
    InsertOutcome, SchemaManager, StoredDocument, TransactionalWriter,
};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::projection::{page_limit, summary_from_parts};

/// Unit of work over a PostgreSQL transaction
pub type PostgresUnitOfWork = AuditUnitOfWork<PostgresAuditWriter>;

const SELECT_COLUMNS: &str = "log_id, source_type, source_key, document";

/// PostgreSQL implementation of the audit table
pub struct PostgresAuditStorage {
    pool: PgPool,
    table_config: AuditTableConfig,
    codec: DocumentCodec,
}

impl PostgresAuditStorage {
    /// Create with the default table name
    pub fn new(pool: PgPool, format: DocumentFormat) -> Self {
        Self::with_config(pool, AuditTableConfig::default(), format)
    }

    /// Create with custom table configuration
    pub fn with_config(pool: PgPool, table_config: AuditTableConfig, format: DocumentFormat) -> Self {
        Self {
            pool,
            table_config,
            codec: DocumentCodec::new(format),
        }
    }

    /// Get the pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self) -> String {
        self.table_config.qualified_name()
    }

    /// Open a transaction for the host's changes and their audit events
    pub async fn begin(&self) -> Result<PostgresUnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(AuditUnitOfWork::new(PostgresAuditWriter {
            tx,
            table: self.table(),
        }))
    }

    /// SQL expressions for the last event's action, timestamp and actor
    fn last_event_columns(&self) -> [&'static str; 3] {
        match self.codec.format() {
            DocumentFormat::Json => [
                "document::jsonb -> 'auditLog' -> -1 ->> 'action'",
                "document::jsonb -> 'auditLog' -> -1 ->> 'timestamp'",
                "document::jsonb -> 'auditLog' -> -1 ->> 'user'",
            ],
            DocumentFormat::Xml => [
                "(xpath('/AuditLog/Entry[last()]/@Action', document::xml))[1]::text",
                "(xpath('/AuditLog/Entry[last()]/@Timestamp', document::xml))[1]::text",
                "(xpath('/AuditLog/Entry[last()]/@User', document::xml))[1]::text",
            ],
        }
    }

    /// SQL predicates for `filter`, numbering parameters from `first`
    fn filter_predicates(&self, filter: &DocumentFilter, first: usize) -> Vec<String> {
        let mut next = first;
        let mut predicates = Vec::new();

        if filter.action.is_some() {
            predicates.push(match self.codec.format() {
                DocumentFormat::Json => format!(
                    "document::jsonb -> 'auditLog' @> jsonb_build_array(jsonb_build_object('action', ${}::text))",
                    next
                ),
                DocumentFormat::Xml => format!(
                    "${}::text = ANY(xpath('/AuditLog/Entry/@Action', document::xml)::text[])",
                    next
                ),
            });
            next += 1;
        }

        if filter.range.is_some() {
            let source = match self.codec.format() {
                DocumentFormat::Json => {
                    "SELECT (e ->> 'timestamp')::timestamptz AS ts \
                     FROM jsonb_array_elements(document::jsonb -> 'auditLog') AS e"
                }
                DocumentFormat::Xml => {
                    "SELECT (t::text)::timestamptz AS ts \
                     FROM unnest(xpath('/AuditLog/Entry/@Timestamp', document::xml)) AS t"
                }
            };
            predicates.push(format!(
                "EXISTS (SELECT 1 FROM ({}) AS events WHERE events.ts BETWEEN ${} AND ${})",
                source,
                next,
                next + 1
            ));
        }

        predicates
    }
}

fn parse_row(row: &PgRow) -> Result<StoredDocument> {
    let log_id: i64 = row.try_get("log_id")?;
    Ok(StoredDocument {
        log_id: log_id.to_string(),
        identity: AuditIdentity::new(
            row.try_get::<String, _>("source_type")?,
            row.try_get::<String, _>("source_key")?,
        ),
        document: row.try_get("document")?,
    })
}

/// xpath() hands attribute values back still escaped
fn unescape_attribute(value: Option<String>) -> Result<Option<String>> {
    value
        .map(|v| unescape_xml(&v).map_err(|e| anyhow!("invalid attribute value '{}': {}", v, e)))
        .transpose()
}

#[async_trait]
impl AuditReader for PostgresAuditStorage {
    async fn list_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<StoredDocument>> {
        let table = self.table();
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = $1 ORDER BY source_key LIMIT $2 OFFSET $3",
            SELECT_COLUMNS, table
        );
        let rows = sqlx::query(&query)
            .bind(source_type)
            .bind(page_limit(take))
            .bind(page_limit(skip))
            .fetch_all(&self.pool)
            .await?;

        debug!(table = %table, source_type, count = rows.len(), "Listed audit documents");
        rows.iter().map(parse_row).collect()
    }

    async fn get_by_identity(&self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = $1 AND source_key = $2",
            SELECT_COLUMNS,
            self.table()
        );
        let row = sqlx::query(&query)
            .bind(&identity.source_type)
            .bind(&identity.source_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    async fn list_matching(&self, source_type: &str, filter: &DocumentFilter) -> Result<Vec<StoredDocument>> {
        let table = self.table();
        let mut query = format!(
            "SELECT {} FROM {} WHERE source_type = $1",
            SELECT_COLUMNS, table
        );
        for predicate in self.filter_predicates(filter, 2) {
            query.push_str(" AND ");
            query.push_str(&predicate);
        }
        query.push_str(" ORDER BY source_key");

        let mut q = sqlx::query(&query).bind(source_type);
        if let Some(action) = filter.action {
            q = q.bind(action.as_str());
        }
        if let Some((from, to)) = filter.range {
            q = q.bind(from).bind(to);
        }
        let rows = q.fetch_all(&self.pool).await?;

        debug!(table = %table, source_type, ?filter, count = rows.len(), "Filtered audit documents");
        rows.iter().map(parse_row).collect()
    }

    async fn summarize(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>> {
        let [action, timestamp, actor] = self.last_event_columns();
        let query = format!(
            "SELECT source_type, source_key, {} AS last_action, {} AS last_timestamp, {} AS last_actor \
             FROM {} WHERE source_type = $1 ORDER BY source_key LIMIT $2 OFFSET $3",
            action,
            timestamp,
            actor,
            self.table()
        );
        let rows = sqlx::query(&query)
            .bind(source_type)
            .bind(page_limit(take))
            .bind(page_limit(skip))
            .fetch_all(&self.pool)
            .await?;

        let xml = self.codec.format() == DocumentFormat::Xml;
        rows.iter()
            .map(|row| {
                let mut actor: Option<String> = row.try_get("last_actor")?;
                if xml {
                    actor = unescape_attribute(actor)?;
                }
                summary_from_parts(
                    row.try_get("source_type")?,
                    row.try_get("source_key")?,
                    row.try_get("last_action")?,
                    row.try_get("last_timestamp")?,
                    actor,
                )
            })
            .collect()
    }
}

#[async_trait]
impl SchemaManager for PostgresAuditStorage {
    fn table_config(&self) -> &AuditTableConfig {
        &self.table_config
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(&self.provisioning_statement())
            .execute(&self.pool)
            .await?;

        info!(table = %self.table(), format = %self.codec.format().as_str(), "Initialized PostgreSQL audit schema");
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(self.table())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    fn provisioning_statement(&self) -> String {
        let create_schema = match &self.table_config.schema {
            Some(schema) => format!("CREATE SCHEMA IF NOT EXISTS {};\n", schema),
            None => String::new(),
        };
        format!(
            r#"{create_schema}CREATE TABLE IF NOT EXISTS {table} (
    log_id BIGSERIAL PRIMARY KEY,
    source_type VARCHAR({max_type}) NOT NULL,
    source_key VARCHAR({max_key}) NOT NULL,
    document TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS {identity_index} ON {table}(source_type, source_key);
CREATE INDEX IF NOT EXISTS {type_index} ON {table}(source_type);
"#,
            table = self.table(),
            max_type = at_common::MAX_SOURCE_TYPE_LEN,
            max_key = at_common::MAX_SOURCE_KEY_LEN,
            identity_index = self.table_config.identity_index(),
            type_index = self.table_config.source_type_index(),
        )
    }

    async fn sample_document(&self) -> Result<Option<String>> {
        let query = format!("SELECT document FROM {} LIMIT 1", self.table());
        Ok(sqlx::query_scalar(&query).fetch_optional(&self.pool).await?)
    }
}

/// Audit row access bound to an open PostgreSQL transaction
pub struct PostgresAuditWriter {
    tx: Transaction<'static, Postgres>,
    table: String,
}

impl PostgresAuditWriter {
    /// The transaction's connection, for the host's own statements
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl AuditWriter for PostgresAuditWriter {
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        // Row lock so a concurrent append waits instead of overwriting
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = $1 AND source_key = $2 FOR UPDATE",
            SELECT_COLUMNS, self.table
        );
        let row = sqlx::query(&query)
            .bind(&identity.source_type)
            .bind(&identity.source_key)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(parse_row).transpose()
    }

    async fn insert_document(&mut self, identity: &AuditIdentity, document: &str) -> Result<InsertOutcome> {
        let query = format!(
            "INSERT INTO {} (source_type, source_key, document) VALUES ($1, $2, $3) \
             ON CONFLICT (source_type, source_key) DO NOTHING RETURNING log_id",
            self.table
        );
        let log_id: Option<i64> = sqlx::query_scalar(&query)
            .bind(&identity.source_type)
            .bind(&identity.source_key)
            .bind(document)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(match log_id {
            Some(id) => InsertOutcome::Inserted { log_id: id.to_string() },
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn update_document(&mut self, log_id: &str, document: &str) -> Result<()> {
        let id: i64 = log_id
            .parse()
            .map_err(|_| anyhow!("invalid audit log id '{}'", log_id))?;
        let query = format!("UPDATE {} SET document = $1 WHERE log_id = $2", self.table);
        let result = sqlx::query(&query)
            .bind(document)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("audit row {} not found in {}", log_id, self.table));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalWriter for PostgresAuditWriter {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
