//! In-Memory Audit Storage
//!
//! A process-local audit table for tests, tooling and embedded use. Writes
//! are staged per transaction and applied on commit, so a dropped unit of
//! work leaves nothing behind.
//!
//! A transaction locks each identity it fetches or inserts until it commits,
//! rolls back or is dropped, like `SELECT ... FOR UPDATE`. A second writer of
//! the same identity waits, then sees the committed row and appends to it.
//! Identities are locked in the order a flush visits them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use at_common::{AuditIdentity, AuditSummary, DocumentFormat};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use crate::document::DocumentCodec;
use crate::repository::{
    AuditReader, AuditTableConfig, AuditWriter, DocumentFilter, InsertOutcome, SchemaManager,
    StoredDocument, TransactionalWriter,
};
use crate::unit_of_work::AuditUnitOfWork;

#[derive(Debug, Clone)]
struct MemoryRow {
    log_id: String,
    document: String,
}

/// Shared in-memory audit table
#[derive(Debug)]
pub struct InMemoryAuditStorage {
    rows: RwLock<BTreeMap<AuditIdentity, MemoryRow>>,
    row_locks: Mutex<HashMap<AuditIdentity, Arc<RowLock<()>>>>,
    next_id: AtomicU64,
    codec: DocumentCodec,
    table_config: AuditTableConfig,
}

impl InMemoryAuditStorage {
    pub fn new(format: DocumentFormat) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            codec: DocumentCodec::new(format),
            table_config: AuditTableConfig::default(),
        }
    }

    /// Start a transaction
    pub fn begin(self: &Arc<Self>) -> InMemoryTransaction {
        InMemoryTransaction {
            storage: Arc::clone(self),
            inserts: HashMap::new(),
            updates: HashMap::new(),
            locked: HashMap::new(),
        }
    }

    /// Start a unit of work over a new transaction
    pub fn unit_of_work(self: &Arc<Self>) -> AuditUnitOfWork<InMemoryTransaction> {
        AuditUnitOfWork::new(self.begin())
    }

    /// Committed row count
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Insert a committed row directly, bypassing any transaction
    pub fn insert_committed(&self, identity: AuditIdentity, document: String) -> Result<String> {
        let mut rows = self.rows.write();
        if rows.contains_key(&identity) {
            bail!("duplicate key value violates unique index on {}", identity);
        }
        let log_id = self.allocate_id();
        rows.insert(
            identity,
            MemoryRow {
                log_id: log_id.clone(),
                document,
            },
        );
        Ok(log_id)
    }

    fn row_lock(&self, identity: &AuditIdentity) -> Arc<RowLock<()>> {
        self.row_locks
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }

    fn identity_of(&self, log_id: &str) -> Option<AuditIdentity> {
        self.rows
            .read()
            .iter()
            .find(|(_, row)| row.log_id == log_id)
            .map(|(identity, _)| identity.clone())
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn stored(identity: &AuditIdentity, row: &MemoryRow) -> StoredDocument {
        StoredDocument {
            log_id: row.log_id.clone(),
            identity: identity.clone(),
            document: row.document.clone(),
        }
    }

    fn of_type(&self, source_type: &str) -> Vec<StoredDocument> {
        self.rows
            .read()
            .iter()
            .filter(|(identity, _)| identity.source_type == source_type)
            .map(|(identity, row)| Self::stored(identity, row))
            .collect()
    }
}

#[async_trait]
impl AuditReader for InMemoryAuditStorage {
    async fn list_by_type(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<StoredDocument>> {
        Ok(self
            .of_type(source_type)
            .into_iter()
            .skip(skip as usize)
            .take(take as usize)
            .collect())
    }

    async fn get_by_identity(&self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        Ok(self
            .rows
            .read()
            .get(identity)
            .map(|row| Self::stored(identity, row)))
    }

    async fn list_matching(&self, source_type: &str, filter: &DocumentFilter) -> Result<Vec<StoredDocument>> {
        let mut matching = Vec::new();
        for row in self.of_type(source_type) {
            let document = self.codec.decode(&row.document)?;
            if filter.matches(document.events()) {
                matching.push(row);
            }
        }
        Ok(matching)
    }

    async fn summarize(&self, source_type: &str, skip: u64, take: u64) -> Result<Vec<AuditSummary>> {
        let rows = self.list_by_type(source_type, skip, take).await?;
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let document = self.codec.decode(&row.document)?;
            let last = document.last();
            summaries.push(AuditSummary {
                source_type: row.identity.source_type,
                source_key: row.identity.source_key,
                last_action: last.map(|e| e.action),
                last_timestamp: last.map(|e| e.timestamp),
                last_actor: last.map(|e| e.actor.clone()),
            });
        }
        Ok(summaries)
    }
}

#[async_trait]
impl SchemaManager for InMemoryAuditStorage {
    fn table_config(&self) -> &AuditTableConfig {
        &self.table_config
    }

    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        Ok(true)
    }

    fn provisioning_statement(&self) -> String {
        "-- in-memory storage needs no provisioning".to_string()
    }

    async fn sample_document(&self) -> Result<Option<String>> {
        Ok(self.rows.read().values().next().map(|r| r.document.clone()))
    }
}

/// Staged writes against an [`InMemoryAuditStorage`]
pub struct InMemoryTransaction {
    storage: Arc<InMemoryAuditStorage>,
    inserts: HashMap<AuditIdentity, MemoryRow>,
    /// log_id -> document
    updates: HashMap<String, String>,
    /// Row locks held until the transaction ends
    locked: HashMap<AuditIdentity, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    async fn lock(&mut self, identity: &AuditIdentity) {
        if self.locked.contains_key(identity) {
            return;
        }
        let guard = self.storage.row_lock(identity).lock_owned().await;
        self.locked.insert(identity.clone(), guard);
    }
}

#[async_trait]
impl AuditWriter for InMemoryTransaction {
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> Result<Option<StoredDocument>> {
        if let Some(row) = self.inserts.get(identity) {
            return Ok(Some(InMemoryAuditStorage::stored(identity, row)));
        }
        self.lock(identity).await;

        let committed = self.storage.rows.read().get(identity).cloned();
        Ok(committed.map(|mut row| {
            if let Some(staged) = self.updates.get(&row.log_id) {
                row.document = staged.clone();
            }
            InMemoryAuditStorage::stored(identity, &row)
        }))
    }

    async fn insert_document(&mut self, identity: &AuditIdentity, document: &str) -> Result<InsertOutcome> {
        if self.inserts.contains_key(identity) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.lock(identity).await;
        if self.storage.rows.read().contains_key(identity) {
            return Ok(InsertOutcome::AlreadyExists);
        }

        let log_id = self.storage.allocate_id();
        self.inserts.insert(
            identity.clone(),
            MemoryRow {
                log_id: log_id.clone(),
                document: document.to_string(),
            },
        );
        Ok(InsertOutcome::Inserted { log_id })
    }

    async fn update_document(&mut self, log_id: &str, document: &str) -> Result<()> {
        if let Some(row) = self.inserts.values_mut().find(|r| r.log_id == log_id) {
            row.document = document.to_string();
            return Ok(());
        }
        let identity = self
            .storage
            .identity_of(log_id)
            .ok_or_else(|| anyhow!("audit row {} not found", log_id))?;
        self.lock(&identity).await;
        self.updates.insert(log_id.to_string(), document.to_string());
        Ok(())
    }
}

#[async_trait]
impl TransactionalWriter for InMemoryTransaction {
    async fn commit(self) -> Result<()> {
        let Self {
            storage,
            inserts,
            updates,
            locked,
        } = self;

        {
            let mut rows = storage.rows.write();

            // Rows added through insert_committed bypass the row locks
            if let Some(identity) = inserts.keys().find(|id| rows.contains_key(*id)) {
                bail!("duplicate key value violates unique index on {}", identity);
            }

            for row in rows.values_mut() {
                if let Some(document) = updates.get(&row.log_id) {
                    row.document = document.clone();
                }
            }
            debug!(inserted = inserts.len(), updated = updates.len(), "Committed in-memory audit transaction");
            rows.extend(inserts);
        }

        drop(locked);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
