//! AuditTrail Storage Adapters
//!
//! Implementations of the audit table for:
//! - SQLite (default; `sqlite` feature)
//! - PostgreSQL (`postgres` feature)
//! - MongoDB (`mongo` feature)
//!
//! [`open_backend`] builds the configured adapter for read-side use.

use std::sync::Arc;

use anyhow::Result;
use at_config::{AuditConfig, StorageBackend};
use at_core::{AuditLogStore, AuditReader, AuditTableConfig, InMemoryAuditStorage, SchemaManager};
use tracing::info;

mod projection;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mongo")]
pub mod mongo;

/// A configured audit table: queryable and provisionable
pub trait AuditBackend: AuditReader + SchemaManager {
    fn into_reader(self: Arc<Self>) -> Arc<dyn AuditReader>;

    fn schema(&self) -> &dyn SchemaManager;
}

impl<T: AuditReader + SchemaManager + 'static> AuditBackend for T {
    fn into_reader(self: Arc<Self>) -> Arc<dyn AuditReader> {
        self
    }

    fn schema(&self) -> &dyn SchemaManager {
        self
    }
}

/// Table configuration from the storage section
pub fn table_config(config: &AuditConfig) -> AuditTableConfig {
    AuditTableConfig::new(&config.storage.table).with_schema(&config.storage.schema)
}

/// Writer configured from the document and writer sections
pub fn log_store(config: &AuditConfig) -> AuditLogStore {
    AuditLogStore::new(config.document.format, config.writer.max_insert_retries)
}

/// Connect to the configured backend
///
/// Does not touch the schema; pair with [`at_core::ensure_schema`].
pub async fn open_backend(config: &AuditConfig) -> Result<Arc<dyn AuditBackend>> {
    config.validate()?;
    let storage = &config.storage;
    let format = config.document.format;

    match storage.backend {
        StorageBackend::Memory => {
            info!(format = %format.as_str(), "Using in-memory audit storage");
            Ok(Arc::new(InMemoryAuditStorage::new(format)))
        }
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            // Every connection to an in-memory database sees its own database
            let max_connections = if storage.url.contains(":memory:") { 1 } else { 5 };
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(&storage.url)
                .await?;
            info!(url = %storage.url, table = %storage.table, "Using SQLite audit storage");
            Ok(Arc::new(sqlite::SqliteAuditStorage::with_config(
                pool,
                table_config(config),
                format,
            )))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&storage.url)
                .await?;
            let tables = table_config(config);
            info!(table = %tables.qualified_name(), "Using PostgreSQL audit storage");
            Ok(Arc::new(postgres::PostgresAuditStorage::with_config(pool, tables, format)))
        }
        #[cfg(feature = "mongo")]
        StorageBackend::Mongo => {
            let client = mongodb::Client::with_uri_str(&storage.url).await?;
            info!(database = %storage.database, collection = %storage.table, "Using MongoDB audit storage");
            Ok(Arc::new(mongo::MongoAuditStorage::with_config(
                client,
                &storage.database,
                table_config(config),
                format,
            )))
        }
        #[allow(unreachable_patterns)]
        other => Err(anyhow::anyhow!(
            "Storage backend '{}' is not compiled in; enable the `{}` feature of at-store",
            other,
            other
        )),
    }
}
