//! SQLite Audit Storage
//!
//! JSON documents are filtered and summarized inside SQLite with the JSON1
//! functions, so only matching rows (or just the last-event attributes) leave
//! the database. SQLite has no XML functions; XML documents are decoded and
//! evaluated in process.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use at_common::{timestamp, AuditIdentity, AuditSummary, DocumentFormat};
use at_core::{
    AuditReader, AuditTableConfig, AuditUnitOfWork, AuditWriter, DocumentCodec, DocumentFilter,
    InsertOutcome, SchemaManager, StoredDocument, TransactionalWriter,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::projection::{filter_decoded, page_limit, summarize_decoded, summary_from_parts};

/// Unit of work over a SQLite transaction
pub type SqliteUnitOfWork = AuditUnitOfWork<SqliteAuditWriter>;

const SELECT_COLUMNS: &str = "log_id, source_type, source_key, document";

/// SQLite implementation of the audit table
pub struct SqliteAuditStorage {
    pool: SqlitePool,
    table_config: AuditTableConfig,
    codec: DocumentCodec,
}

impl SqliteAuditStorage {
    /// Create with the default table name
    pub fn new(pool: SqlitePool, format: DocumentFormat) -> Self {
        Self::with_config(pool, AuditTableConfig::default(), format)
    }

    /// Create with custom table configuration
    ///
    /// SQLite has no schemas; `table_config.schema` is ignored.
    pub fn with_config(pool: SqlitePool, table_config: AuditTableConfig, format: DocumentFormat) -> Self {
        Self {
            pool,
            table_config: AuditTableConfig::new(table_config.table),
            codec: DocumentCodec::new(format),
        }
    }

    /// Get the pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self) -> &str {
        &self.table_config.table
    }

    /// Open a transaction for the host's changes and their audit events
    ///
    /// The write lock is taken up front, so a second unit of work waits for
    /// the first to finish instead of reading a snapshot it cannot write from.
    pub async fn begin(&self) -> Result<SqliteUnitOfWork> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(AuditUnitOfWork::new(SqliteAuditWriter {
            tx,
            table: self.table().to_string(),
        }))
    }

    async fn list_all_of_type(&self, source_type: &str) -> Result<Vec<StoredDocument>> {
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = ? ORDER BY source_key",
            SELECT_COLUMNS,
            self.table()
        );
        let rows = sqlx::query(&query)
            .bind(source_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_row).collect()
    }
}

fn parse_row(row: &SqliteRow) -> Result<StoredDocument> {
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

fn parse_log_id(log_id: &str) -> Result<i64> {
    log_id
        .parse()
        .map_err(|_| anyhow!("invalid audit log id '{}'", log_id))
}

#[async_trait]
impl AuditReader for SqliteAuditStorage {
    async fn list_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<StoredDocument>> {
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = ? ORDER BY source_key LIMIT ? OFFSET ?",
            SELECT_COLUMNS,
            self.table()
        );
        let rows = sqlx::query(&query)
            .bind(source_type)
            .bind(page_limit(take))
            .bind(page_limit(skip))
            .fetch_all(&self.pool)
            .await?;

        debug!(table = %self.table(), source_type, count = rows.len(), "Listed audit documents");
        rows.iter().map(parse_row).collect()
    }

    async fn get_by_identity(&self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = ? AND source_key = ?",
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
        if self.codec.format() == DocumentFormat::Xml {
            let rows = self.list_all_of_type(source_type).await?;
            return filter_decoded(&self.codec, rows, filter);
        }

        let mut query = format!(
            "SELECT {} FROM {} AS a WHERE a.source_type = ?",
            SELECT_COLUMNS,
            self.table()
        );
        if filter.action.is_some() {
            query.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(a.document, '$.auditLog') AS e \
                 WHERE json_extract(e.value, '$.action') = ?)",
            );
        }
        if filter.range.is_some() {
            query.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(a.document, '$.auditLog') AS e \
                 WHERE julianday(json_extract(e.value, '$.timestamp')) BETWEEN julianday(?) AND julianday(?))",
            );
        }
        query.push_str(" ORDER BY a.source_key");

        let mut q = sqlx::query(&query).bind(source_type);
        if let Some(action) = filter.action {
            q = q.bind(action.as_str());
        }
        if let Some((from, to)) = filter.range {
            q = q.bind(timestamp::format(&from)).bind(timestamp::format(&to));
        }
        let rows = q.fetch_all(&self.pool).await?;

        debug!(table = %self.table(), source_type, ?filter, count = rows.len(), "Filtered audit documents");
        rows.iter().map(parse_row).collect()
    }

    async fn summarize(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>> {
        if self.codec.format() == DocumentFormat::Xml {
            let rows = self.list_by_type(source_type, skip, take).await?;
            return summarize_decoded(&self.codec, rows);
        }

        let query = format!(
            "SELECT source_type, source_key, \
             json_extract(document, '$.auditLog[#-1].action') AS last_action, \
             json_extract(document, '$.auditLog[#-1].timestamp') AS last_timestamp, \
             json_extract(document, '$.auditLog[#-1].user') AS last_actor \
             FROM {} WHERE source_type = ? ORDER BY source_key LIMIT ? OFFSET ?",
            self.table()
        );
        let rows = sqlx::query(&query)
            .bind(source_type)
            .bind(page_limit(take))
            .bind(page_limit(skip))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                summary_from_parts(
                    row.try_get("source_type")?,
                    row.try_get("source_key")?,
                    row.try_get("last_action")?,
                    row.try_get("last_timestamp")?,
                    row.try_get("last_actor")?,
                )
            })
            .collect()
    }
}

#[async_trait]
impl SchemaManager for SqliteAuditStorage {
    fn table_config(&self) -> &AuditTableConfig {
        &self.table_config
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(&self.provisioning_statement())
            .execute(&self.pool)
            .await?;

        info!(table = %self.table(), "Initialized SQLite audit schema");
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(self.table())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    fn provisioning_statement(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL CHECK (length(source_type) <= {max_type}),
    source_key TEXT NOT NULL CHECK (length(source_key) <= {max_key}),
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

/// Audit row access bound to an open SQLite transaction
pub struct SqliteAuditWriter {
    tx: Transaction<'static, Sqlite>,
    table: String,
}

impl SqliteAuditWriter {
    /// The transaction's connection, for the host's own statements
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl AuditWriter for SqliteAuditWriter {
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        let query = format!(
            "SELECT {} FROM {} WHERE source_type = ? AND source_key = ?",
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
            "INSERT INTO {} (source_type, source_key, document) VALUES (?, ?, ?) \
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
        let query = format!("UPDATE {} SET document = ? WHERE log_id = ?", self.table);
        let result = sqlx::query(&query)
            .bind(document)
            .bind(parse_log_id(log_id)?)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("audit row {} not found in {}", log_id, self.table));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalWriter for SqliteAuditWriter {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
