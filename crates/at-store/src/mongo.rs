//! MongoDB Audit Storage
//!
//! One BSON document per audited entity. JSON-format audit documents are
//! embedded as sub-documents so the server can filter and summarize them;
//! XML-format documents are stored as strings and evaluated in process.
//!
//! Writers need a replica set: they run inside a multi-document transaction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use at_common::{AuditIdentity, AuditSummary, DocumentFormat};
use at_core::{
    AuditReader, AuditTableConfig, AuditUnitOfWork, AuditWriter, DocumentCodec, DocumentFilter,
    InsertOutcome, SchemaManager, StoredDocument, TransactionalWriter,
};
use futures::stream::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tracing::{debug, info};

use crate::projection::{filter_decoded, page_limit, summarize_decoded, summary_from_parts};

/// Unit of work over a MongoDB session transaction
pub type MongoUnitOfWork = AuditUnitOfWork<MongoAuditWriter>;

/// MongoDB implementation of the audit collection
pub struct MongoAuditStorage {
    client: Client,
    database: Database,
    table_config: AuditTableConfig,
    codec: DocumentCodec,
}

impl MongoAuditStorage {
    /// Create with the default collection name
    pub fn new(client: Client, db_name: &str, format: DocumentFormat) -> Self {
        Self::with_config(client, db_name, AuditTableConfig::default(), format)
    }

    /// Create with custom collection configuration
    pub fn with_config(
        client: Client,
        db_name: &str,
        table_config: AuditTableConfig,
        format: DocumentFormat,
    ) -> Self {
        let database = client.database(db_name);
        Self {
            client,
            database,
            table_config: AuditTableConfig::new(table_config.table),
            codec: DocumentCodec::new(format),
        }
    }

    /// Get the database reference
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self) -> Collection<Document> {
        self.database.collection(&self.table_config.table)
    }

    /// Open a session transaction for the host's changes and their audit events
    pub async fn begin(&self) -> Result<MongoUnitOfWork> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(AuditUnitOfWork::new(MongoAuditWriter {
            session,
            collection: self.collection(),
            format: self.codec.format(),
        }))
    }

    async fn find_documents(&self, filter: Document, options: FindOptions) -> Result<Vec<StoredDocument>> {
        let mut cursor = self.collection().find(filter).with_options(options).await?;
        let mut rows = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            rows.push(parse_doc(&doc)?);
        }
        Ok(rows)
    }
}

/// Audit document text to the value stored in the `document` field
fn to_stored(format: DocumentFormat, text: &str) -> Result<Bson> {
    match format {
        DocumentFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(text)?;
            Ok(mongodb::bson::to_bson(&value)?)
        }
        DocumentFormat::Xml => Ok(Bson::String(text.to_string())),
    }
}

/// The `document` field back to audit document text
fn from_stored(value: &Bson) -> Result<String> {
    match value {
        Bson::String(text) => Ok(text.clone()),
        Bson::Document(_) => Ok(serde_json::to_string(&value.clone().into_relaxed_extjson())?),
        other => Err(anyhow!("unexpected audit document type {:?}", other.element_type())),
    }
}

fn parse_doc(doc: &Document) -> Result<StoredDocument> {
    Ok(StoredDocument {
        log_id: doc.get_object_id("_id")?.to_hex(),
        identity: AuditIdentity::new(doc.get_str("source_type")?, doc.get_str("source_key")?),
        document: from_stored(
            doc.get("document")
                .ok_or_else(|| anyhow!("audit row without a document field"))?,
        )?,
    })
}

fn identity_filter(identity: &AuditIdentity) -> Document {
    doc! {
        "source_type": &identity.source_type,
        "source_key": &identity.source_key,
    }
}

fn by_key() -> FindOptions {
    FindOptions::builder().sort(doc! { "source_key": 1 }).build()
}

/// Server-side filter for embedded JSON documents
fn json_filter(source_type: &str, filter: &DocumentFilter) -> Document {
    let mut query = doc! { "source_type": source_type };
    if let Some(action) = filter.action {
        query.insert("document.auditLog.action", action.as_str());
    }
    if let Some((from, to)) = filter.range {
        let ts = doc! { "$dateFromString": { "dateString": "$$e.timestamp" } };
        query.insert(
            "$expr",
            doc! {
                "$gt": [
                    { "$size": {
                        "$filter": {
                            "input": "$document.auditLog",
                            "as": "e",
                            "cond": { "$and": [
                                { "$gte": [ts.clone(), BsonDateTime::from_millis(from.timestamp_millis())] },
                                { "$lte": [ts, BsonDateTime::from_millis(to.timestamp_millis())] },
                            ]},
                        }
                    }},
                    0,
                ]
            },
        );
    }
    query
}

#[async_trait]
impl AuditReader for MongoAuditStorage {
    async fn list_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<StoredDocument>> {
        if take == 0 {
            return Ok(Vec::new());
        }
        let options = FindOptions::builder()
            .sort(doc! { "source_key": 1 })
            .skip(skip)
            .limit(page_limit(take))
            .build();
        let rows = self
            .find_documents(doc! { "source_type": source_type }, options)
            .await?;

        debug!(
            collection = %self.table_config.table,
            source_type,
            count = rows.len(),
            "Listed audit documents"
        );
        Ok(rows)
    }

    async fn get_by_identity(&self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        let doc = self.collection().find_one(identity_filter(identity)).await?;
        doc.as_ref().map(parse_doc).transpose()
    }

    async fn list_matching(&self, source_type: &str, filter: &DocumentFilter) -> Result<Vec<StoredDocument>> {
        match self.codec.format() {
            DocumentFormat::Json => {
                let rows = self.find_documents(json_filter(source_type, filter), by_key()).await?;
                debug!(
                    collection = %self.table_config.table,
                    source_type,
                    ?filter,
                    count = rows.len(),
                    "Filtered audit documents"
                );
                Ok(rows)
            }
            DocumentFormat::Xml => {
                let rows = self
                    .find_documents(doc! { "source_type": source_type }, by_key())
                    .await?;
                filter_decoded(&self.codec, rows, filter)
            }
        }
    }

    async fn summarize(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>> {
        if self.codec.format() == DocumentFormat::Xml {
            let rows = self.list_by_type(source_type, skip, take).await?;
            return summarize_decoded(&self.codec, rows);
        }
        if take == 0 {
            return Ok(Vec::new());
        }

        let pipeline = vec![
            doc! { "$match": { "source_type": source_type } },
            doc! { "$sort": { "source_key": 1 } },
            doc! { "$skip": page_limit(skip) },
            doc! { "$limit": page_limit(take) },
            doc! { "$project": {
                "source_type": 1,
                "source_key": 1,
                "last": { "$arrayElemAt": ["$document.auditLog", -1] },
            }},
        ];
        let mut cursor = self.collection().aggregate(pipeline).await?;

        let mut summaries = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let last = doc.get_document("last").ok();
            let field = |name: &str| last.and_then(|l| l.get_str(name).ok()).map(String::from);
            summaries.push(summary_from_parts(
                doc.get_str("source_type")?.to_string(),
                doc.get_str("source_key")?.to_string(),
                field("action"),
                field("timestamp"),
                field("user"),
            )?);
        }
        Ok(summaries)
    }
}

#[async_trait]
impl SchemaManager for MongoAuditStorage {
    fn table_config(&self) -> &AuditTableConfig {
        &self.table_config
    }

    async fn init_schema(&self) -> Result<()> {
        if !self.schema_exists().await? {
            self.database.create_collection(&self.table_config.table).await?;
        }

        let identity_index = IndexModel::builder()
            .keys(doc! { "source_type": 1, "source_key": 1 })
            .options(
                IndexOptions::builder()
                    .name(self.table_config.identity_index())
                    .unique(true)
                    .build(),
            )
            .build();
        let type_index = IndexModel::builder()
            .keys(doc! { "source_type": 1 })
            .options(IndexOptions::builder().name(self.table_config.source_type_index()).build())
            .build();
        self.collection().create_indexes([identity_index, type_index]).await?;

        info!(collection = %self.table_config.table, "Initialized MongoDB audit collection");
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        let names = self.database.list_collection_names().await?;
        Ok(names.iter().any(|n| n == &self.table_config.table))
    }

    fn provisioning_statement(&self) -> String {
        format!(
            "db.createCollection(\"{table}\");\n\
             db.{table}.createIndex({{ source_type: 1, source_key: 1 }}, {{ name: \"{identity}\", unique: true }});\n\
             db.{table}.createIndex({{ source_type: 1 }}, {{ name: \"{by_type}\" }});\n",
            table = self.table_config.table,
            identity = self.table_config.identity_index(),
            by_type = self.table_config.source_type_index(),
        )
    }

    async fn sample_document(&self) -> Result<Option<String>> {
        let doc = self.collection().find_one(doc! {}).await?;
        doc.as_ref()
            .and_then(|d| d.get("document"))
            .map(from_stored)
            .transpose()
    }
}

/// Audit document access bound to an open session transaction
pub struct MongoAuditWriter {
    session: ClientSession,
    collection: Collection<Document>,
    format: DocumentFormat,
}

impl MongoAuditWriter {
    /// The transaction's session, for the host's own operations
    pub fn session(&mut self) -> &mut ClientSession {
        &mut self.session
    }
}

#[async_trait]
impl AuditWriter for MongoAuditWriter {
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        let doc = self
            .collection
            .find_one(identity_filter(identity))
            .session(&mut self.session)
            .await?;
        doc.as_ref().map(parse_doc).transpose()
    }

    async fn insert_document(&mut self, identity: &AuditIdentity, document: &str) -> Result<InsertOutcome> {
        // A duplicate-key error would abort the whole transaction, so the
        // insert is an upsert that only writes when the identity is new.
        let update = doc! {
            "$setOnInsert": {
                "source_type": &identity.source_type,
                "source_key": &identity.source_key,
                "document": to_stored(self.format, document)?,
            }
        };
        let result = self
            .collection
            .update_one(identity_filter(identity), update)
            .upsert(true)
            .session(&mut self.session)
            .await?;

        Ok(match result.upserted_id {
            Some(Bson::ObjectId(id)) => InsertOutcome::Inserted { log_id: id.to_hex() },
            Some(other) => InsertOutcome::Inserted { log_id: other.to_string() },
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn update_document(&mut self, log_id: &str, document: &str) -> Result<()> {
        let id = ObjectId::parse_str(log_id)
            .map_err(|_| anyhow!("invalid audit log id '{}'", log_id))?;
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "document": to_stored(self.format, document)? } },
            )
            .session(&mut self.session)
            .await?;

        if result.matched_count == 0 {
            return Err(anyhow!("audit document {} not found", log_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalWriter for MongoAuditWriter {
    async fn commit(mut self) -> Result<()> {
        self.session.commit_transaction().await?;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}
