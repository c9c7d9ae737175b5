//! End-to-end tests of the audit engine over in-memory storage

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use at_core::{
    AuditAction, AuditBuffer, AuditDocument, AuditError, AuditIdentity, AuditLogStore, AuditQueryService,
    AuditReader, AuditRegistry, AuditUnitOfWork, AuditValue, AuditWriter, Auditor, ChangeEvent,
    DocumentCodec, DocumentFormat, EntityDescriptor, FieldChange, FixedClock, InMemoryAuditStorage,
    InMemoryTransaction, InsertOutcome, LookupDescriptor, ReferenceCache, ReferenceInstance,
    ReferenceSource, RelatedDescriptor, StaticActor, StoredDocument, SuppliedReferences,
    TransactionalWriter,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test model
// ============================================================================

#[derive(Clone)]
struct Product {
    id: i64,
    name: String,
    price: f64,
    stock: i32,
}

struct ProductTag {
    product_id: i64,
    tag: String,
}

struct User {
    id: String,
    email: String,
}

struct UserRole {
    user_id: String,
    role_id: String,
}

struct Role {
    id: String,
    name: String,
}

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 11, 10, 0, 0).unwrap() + Duration::minutes(minute)
}

fn registry() -> Arc<AuditRegistry> {
    let product = EntityDescriptor::builder("Product", |p: &Product| p.id.to_string())
        .property("Name", |p: &Product| p.name.clone())
        .property("Price", |p: &Product| p.price)
        .property("Stock", |p: &Product| p.stock)
        .build()
        .unwrap();

    let tag = RelatedDescriptor::builder("ProductTag", |t: &ProductTag| t.product_id.to_string())
        .property("Tag", |t: &ProductTag| t.tag.clone())
        .build()
        .unwrap();

    let user = EntityDescriptor::builder("User", |u: &User| u.id.clone())
        .property("Email", |u: &User| u.email.clone())
        .build()
        .unwrap();

    let role_lookup = LookupDescriptor::builder::<Role, _, _, _, _>(
        "RoleId",
        |ur: &UserRole| ur.role_id.clone(),
        |r: &Role| r.id.clone(),
    )
    .display("RoleName", |r: &Role| r.name.clone())
    .build()
    .unwrap();

    let user_role = RelatedDescriptor::builder("UserRole", |ur: &UserRole| ur.user_id.clone())
        .property("RoleId", |ur: &UserRole| ur.role_id.clone())
        .lookup(role_lookup)
        .build()
        .unwrap();

    Arc::new(
        AuditRegistry::builder()
            .entity(product)
            .related::<Product, _>(tag)
            .entity(user)
            .related::<User, _>(user_role)
            .build()
            .unwrap(),
    )
}

struct Harness {
    storage: Arc<InMemoryAuditStorage>,
    registry: Arc<AuditRegistry>,
    format: DocumentFormat,
}

impl Harness {
    fn new(format: DocumentFormat) -> Self {
        Self {
            storage: Arc::new(InMemoryAuditStorage::new(format)),
            registry: registry(),
            format,
        }
    }

    fn auditor_at(&self, minute: i64) -> Auditor {
        Auditor::new(
            self.registry.clone(),
            Arc::new(StaticActor::new("admin")),
            AuditLogStore::new(self.format, 3),
        )
        .with_clock(Arc::new(FixedClock(t(minute))))
    }

    fn queries(&self) -> AuditQueryService {
        AuditQueryService::new(self.storage.clone(), DocumentCodec::new(self.format))
            .with_clock(Arc::new(FixedClock(t(1000))))
    }

    async fn commit<F>(&self, minute: i64, record: F)
    where
        F: FnOnce(&Auditor, &mut AuditBuffer),
    {
        let auditor = self.auditor_at(minute);
        let mut uow = self.storage.unit_of_work();
        record(&auditor, uow.buffer_mut());
        uow.commit(&auditor, &CancellationToken::new()).await.unwrap();
    }
}

fn laptop() -> Product {
    Product { id: 42, name: "Laptop".into(), price: 79.99, stock: 100 }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_create_then_update() {
    for format in [DocumentFormat::Json, DocumentFormat::Xml] {
        let h = Harness::new(format);
        let before = laptop();
        let after = Product { price: 69.99, stock: 95, ..laptop() };

        h.commit(0, |a, buf| {
            assert!(a.entity_changed(buf, None, Some(&before)).unwrap());
        })
        .await;
        h.commit(1, |a, buf| {
            assert!(a.entity_changed(buf, Some(&before), Some(&after)).unwrap());
        })
        .await;

        let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[0], ChangeEvent::new(AuditAction::Created, "admin", t(0)));
        assert_eq!(
            log.events[1],
            ChangeEvent::new(AuditAction::Updated, "admin", t(1)).with_fields(vec![
                FieldChange::diff("Price", Some("79.99".into()), Some("69.99".into())),
                FieldChange::diff("Stock", Some("100".into()), Some("95".into())),
            ])
        );
    }
}

#[tokio::test]
async fn test_scenario_b_related_add_then_delete() {
    let h = Harness::new(DocumentFormat::Json);
    let product = laptop();
    let tag = ProductTag { product_id: 42, tag: "Gaming".into() };

    h.commit(0, |a, buf| {
        a.entity_changed(buf, None, Some(&product)).unwrap();
    })
    .await;
    h.commit(2, |a, buf| {
        a.related_changed(buf, None, Some(&tag), SuppliedReferences::none()).unwrap();
    })
    .await;
    h.commit(3, |a, buf| {
        a.entity_changed(buf, Some(&product), None).unwrap();
    })
    .await;

    let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
    assert_eq!(
        log.events[1],
        ChangeEvent::new(AuditAction::Added, "admin", t(2))
            .with_related("ProductTag")
            .with_fields(vec![FieldChange::captured("Tag", Some("Gaming".into()))])
    );
    assert_eq!(log.events[2], ChangeEvent::new(AuditAction::Deleted, "admin", t(3)));

    let summary = h.queries().get_audit_summary("Product", 0, 10).await.unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].source_key, "42");
    assert_eq!(summary[0].last_action, Some(AuditAction::Deleted));
    assert_eq!(summary[0].last_timestamp, Some(t(3)));
    assert_eq!(summary[0].last_actor.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_scenario_c_lookup_replaces_foreign_key() {
    let h = Harness::new(DocumentFormat::Xml);
    let user = User { id: "u1".into(), email: "u1@example.com".into() };
    let role = Role { id: "r1".into(), name: "Administrator".into() };
    let user_role = UserRole { user_id: "u1".into(), role_id: "r1".into() };

    h.commit(0, |a, buf| {
        a.entity_changed(buf, None, Some(&user)).unwrap();
        let refs: [&dyn Any; 1] = [&role];
        a.related_changed(buf, None, Some(&user_role), SuppliedReferences::after(&refs))
            .unwrap();
    })
    .await;

    let log = h.queries().get_log("User", "u1").await.unwrap().unwrap();
    let added = &log.events[1];
    assert_eq!(added.action, AuditAction::Added);
    assert_eq!(added.related_type.as_deref(), Some("UserRole"));
    assert_eq!(added.fields, vec![FieldChange::captured("RoleName", Some("Administrator".into()))]);
    assert!(log.events.iter().all(|e| e.field("RoleId").is_none()));
    assert_eq!(user.email, "u1@example.com");
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_update_without_changes_writes_nothing() {
    let h = Harness::new(DocumentFormat::Json);
    let p = laptop();
    h.commit(0, |a, buf| {
        assert!(!a.entity_changed(buf, Some(&p), Some(&p.clone())).unwrap());
        assert!(buf.is_empty());
    })
    .await;
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_lookup_diff_only_reports_changed_display_values() {
    let h = Harness::new(DocumentFormat::Json);
    let admin = Role { id: "r1".into(), name: "Administrator".into() };
    let admin_renamed_id = Role { id: "r9".into(), name: "Administrator".into() };
    let viewer = Role { id: "r2".into(), name: "Viewer".into() };
    let before = UserRole { user_id: "u1".into(), role_id: "r1".into() };
    let to_viewer = UserRole { user_id: "u1".into(), role_id: "r2".into() };
    let to_same_name = UserRole { user_id: "u1".into(), role_id: "r9".into() };

    h.commit(0, |a, buf| {
        let old: [&dyn Any; 1] = [&admin];
        let new: [&dyn Any; 1] = [&viewer];
        assert!(a
            .related_changed(buf, Some(&before), Some(&to_viewer), SuppliedReferences::both(&old, &new))
            .unwrap());

        // key changed but the display value did not
        let same: [&dyn Any; 1] = [&admin_renamed_id];
        assert!(!a
            .related_changed(buf, Some(&before), Some(&to_same_name), SuppliedReferences::both(&old, &same))
            .unwrap());
    })
    .await;

    let log = h.queries().get_log("User", "u1").await.unwrap().unwrap();
    assert_eq!(log.events.len(), 1);
    assert_eq!(
        log.events[0].fields,
        vec![FieldChange::diff("RoleName", Some("Administrator".into()), Some("Viewer".into()))]
    );
}

struct RoleStore {
    roles: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

#[async_trait]
impl ReferenceSource for RoleStore {
    async fn find_by_key(&self, _reference_type: &str, key: &AuditValue) -> anyhow::Result<Option<ReferenceInstance>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = key.canonical().unwrap_or_default();
        Ok(self
            .roles
            .iter()
            .find(|(id, _)| *id == key)
            .map(|(id, name)| Arc::new(Role { id: id.to_string(), name: name.to_string() }) as ReferenceInstance))
    }
}

#[tokio::test]
async fn test_pull_lookup_and_missing_reference() {
    let h = Harness::new(DocumentFormat::Json);
    let auditor = h.auditor_at(0);
    let source = RoleStore { roles: vec![("r1", "Administrator")], calls: AtomicUsize::new(0) };
    let cache = ReferenceCache::new();

    let mut uow = h.storage.unit_of_work();
    let known = UserRole { user_id: "u1".into(), role_id: "r1".into() };
    let missing = UserRole { user_id: "u2".into(), role_id: "gone".into() };
    auditor
        .related_changed_pull(uow.buffer_mut(), None, Some(&known), &cache, &source)
        .await
        .unwrap();
    auditor
        .related_changed_pull(uow.buffer_mut(), None, Some(&missing), &cache, &source)
        .await
        .unwrap();
    uow.commit(&auditor, &CancellationToken::new()).await.unwrap();

    let queries = h.queries();
    let u1 = queries.get_log("User", "u1").await.unwrap().unwrap();
    assert_eq!(u1.events[0].fields[0].value.as_deref(), Some("Administrator"));
    // unresolved lookup: event kept, lookup fields omitted
    let u2 = queries.get_log("User", "u2").await.unwrap().unwrap();
    assert_eq!(u2.events[0].action, AuditAction::Added);
    assert!(u2.events[0].fields.is_empty());
}

#[tokio::test]
async fn test_summary_reports_last_array_position_despite_clock_skew() {
    let h = Harness::new(DocumentFormat::Json);
    let p = laptop();
    h.commit(50, |a, buf| {
        a.entity_changed(buf, None, Some(&p)).unwrap();
    })
    .await;
    // written later with a skewed, earlier clock
    h.commit(10, |a, buf| {
        let cheaper = Product { price: 1.0, ..p.clone() };
        a.entity_changed(buf, Some(&p), Some(&cheaper)).unwrap();
    })
    .await;

    let summary = h.queries().get_audit_summary("Product", 0, 10).await.unwrap();
    assert_eq!(summary[0].last_action, Some(AuditAction::Updated));
    assert_eq!(summary[0].last_timestamp, Some(t(10)));
}

#[tokio::test]
async fn test_queries_by_action_and_range() {
    let h = Harness::new(DocumentFormat::Xml);
    for id in 1..=3 {
        let p = Product { id, ..laptop() };
        h.commit(id * 10, |a, buf| {
            a.entity_changed(buf, None, Some(&p)).unwrap();
        })
        .await;
    }
    let p2 = Product { id: 2, ..laptop() };
    h.commit(40, |a, buf| {
        a.entity_changed(buf, Some(&p2), None).unwrap();
    })
    .await;

    let q = h.queries();
    let deleted = q.get_logs_by_action("Product", AuditAction::Deleted).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].source_key, "2");

    // inclusive at both ends
    let ranged = q.get_logs_by_date_range("Product", t(10), Some(t(20))).await.unwrap();
    let keys: Vec<_> = ranged.iter().map(|l| l.source_key.as_str()).collect();
    assert_eq!(keys, vec!["1", "2"]);

    // default upper bound is now
    assert_eq!(q.get_logs_by_date_range("Product", t(0), None).await.unwrap().len(), 3);

    let both = q
        .get_logs_by_action_and_date_range("Product", AuditAction::Created, t(35), None)
        .await
        .unwrap();
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].source_key, "2");

    assert!(matches!(
        q.get_logs_by_date_range("Product", t(20), Some(t(10))).await,
        Err(AuditError::InvalidQuery { .. })
    ));
}

#[tokio::test]
async fn test_paging_is_ordered_by_source_key() {
    let h = Harness::new(DocumentFormat::Json);
    for key in ["c", "a", "b"] {
        h.commit(0, |a, buf| {
            a.record(
                buf,
                AuditIdentity::new("Import", key),
                ChangeEvent::new(AuditAction::Created, "loader", t(0)),
            )
            .unwrap();
        })
        .await;
    }

    let q = h.queries();
    let page = q.get_logs_by_type("Import", 1, 2).await.unwrap();
    let keys: Vec<_> = page.iter().map(|l| l.source_key.as_str()).collect();
    assert_eq!(keys, vec!["b", "c"]);
    assert!(q.get_logs_by_type("Import", 0, 0).await.unwrap().is_empty());
    assert!(q.get_log("Import", "zzz").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recorded_update_without_fields_is_dropped() {
    let h = Harness::new(DocumentFormat::Json);
    h.commit(0, |a, buf| {
        let identity = AuditIdentity::new("Import", "1");
        let empty = ChangeEvent::new(AuditAction::Updated, "loader", t(0));
        assert!(!a.record(buf, identity.clone(), empty).unwrap());
        assert!(buf.is_empty());

        let priced = ChangeEvent::new(AuditAction::Updated, "loader", t(0))
            .with_fields(vec![FieldChange::diff("Price", None, Some("5".into()))]);
        assert!(a.record(buf, identity, priced).unwrap());
    })
    .await;

    let log = h.queries().get_log("Import", "1").await.unwrap().unwrap();
    assert_eq!(log.events.len(), 1);
    assert_eq!(log.events[0].fields.len(), 1);
}

#[tokio::test]
async fn test_pending_key_is_resolved_before_flush() {
    let h = Harness::new(DocumentFormat::Json);
    let auditor = h.auditor_at(0);
    let mut uow = h.storage.unit_of_work();

    let draft = Product { id: 0, ..laptop() };
    let pending = auditor.entity_created_pending(uow.buffer_mut(), &draft).unwrap();
    uow.buffer_mut().assign_key(pending, "1001");
    uow.commit(&auditor, &CancellationToken::new()).await.unwrap();

    assert!(h.queries().get_log("Product", "1001").await.unwrap().is_some());
}

#[tokio::test]
async fn test_unassigned_pending_key_rolls_back() {
    let h = Harness::new(DocumentFormat::Json);
    let auditor = h.auditor_at(0);
    let mut uow = h.storage.unit_of_work();

    auditor.entity_changed(uow.buffer_mut(), None, Some(&laptop())).unwrap();
    let _pending = auditor
        .entity_created_pending(uow.buffer_mut(), &Product { id: 0, ..laptop() })
        .unwrap();

    let err = uow.commit(&auditor, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AuditError::UnresolvedKey { .. }));
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_unconfigured_entity_is_a_configuration_error() {
    struct Invoice;
    let h = Harness::new(DocumentFormat::Json);
    let auditor = h.auditor_at(0);
    let mut buffer = AuditBuffer::new();
    let err = auditor.entity_changed(&mut buffer, None, Some(&Invoice)).unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_cancelled_commit_persists_nothing() {
    let h = Harness::new(DocumentFormat::Json);
    let auditor = h.auditor_at(0);
    let mut uow = h.storage.unit_of_work();
    auditor.entity_changed(uow.buffer_mut(), None, Some(&laptop())).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = uow.commit(&auditor, &cancel).await.unwrap_err();
    assert!(matches!(err, AuditError::Cancelled));
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_format_mismatch_fails_the_write() {
    let h = Harness::new(DocumentFormat::Json);
    h.storage
        .insert_committed(AuditIdentity::new("Product", "42"), "<AuditLog/>".into())
        .unwrap();

    let auditor = h.auditor_at(0);
    let mut uow = h.storage.unit_of_work();
    auditor.entity_changed(uow.buffer_mut(), Some(&laptop()), None).unwrap();
    let err = uow.commit(&auditor, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_configuration());

    let stored = h.storage.get_by_identity(&AuditIdentity::new("Product", "42")).await.unwrap();
    assert_eq!(stored.unwrap().document, "<AuditLog/>");
}

// ============================================================================
// Insert race
// ============================================================================

/// Commits a competing first document right before this writer's first insert
struct RacingWriter {
    inner: InMemoryTransaction,
    storage: Arc<InMemoryAuditStorage>,
    competitor: Option<String>,
}

#[async_trait]
impl AuditWriter for RacingWriter {
    async fn fetch_document(&mut self, identity: &AuditIdentity) -> anyhow::Result<Option<StoredDocument>> {
        self.inner.fetch_document(identity).await
    }

    async fn insert_document(&mut self, identity: &AuditIdentity, document: &str) -> anyhow::Result<InsertOutcome> {
        if let Some(competing) = self.competitor.take() {
            self.storage.insert_committed(identity.clone(), competing)?;
        }
        self.inner.insert_document(identity, document).await
    }

    async fn update_document(&mut self, log_id: &str, document: &str) -> anyhow::Result<()> {
        self.inner.update_document(log_id, document).await
    }
}

#[async_trait]
impl TransactionalWriter for RacingWriter {
    async fn commit(self) -> anyhow::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self) -> anyhow::Result<()> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn test_lost_insert_race_merges_into_winner() {
    for format in [DocumentFormat::Json, DocumentFormat::Xml] {
        let h = Harness::new(format);
        let codec = DocumentCodec::new(format);
        let winner = codec
            .merge(None, ChangeEvent::new(AuditAction::Created, "other-process", t(0)))
            .unwrap();

        let writer = RacingWriter {
            inner: h.storage.begin(),
            storage: h.storage.clone(),
            competitor: Some(winner),
        };
        let mut uow = AuditUnitOfWork::new(writer);
        let auditor = h.auditor_at(1);
        let p = laptop();
        let changed = Product { stock: 1, ..laptop() };
        auditor.entity_changed(uow.buffer_mut(), Some(&p), Some(&changed)).unwrap();
        let report = uow.commit(&auditor, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 0);

        let rows = h.storage.list_by_type("Product", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[0].actor, "other-process");
        assert_eq!(log.events[1].action, AuditAction::Updated);
    }
}

/// Never sees the row it keeps colliding with
struct AlwaysConflicting {
    inserts: usize,
}

#[async_trait]
impl AuditWriter for AlwaysConflicting {
    async fn fetch_document(&mut self, _identity: &AuditIdentity) -> anyhow::Result<Option<StoredDocument>> {
        Ok(None)
    }

    async fn insert_document(&mut self, _identity: &AuditIdentity, _document: &str) -> anyhow::Result<InsertOutcome> {
        self.inserts += 1;
        Ok(InsertOutcome::AlreadyExists)
    }

    async fn update_document(&mut self, _log_id: &str, _document: &str) -> anyhow::Result<()> {
        unreachable!("no row is ever fetched")
    }
}

#[tokio::test]
async fn test_insert_race_retries_are_bounded() {
    let store = AuditLogStore::new(DocumentFormat::Json, 2);
    let mut writer = AlwaysConflicting { inserts: 0 };
    let events = vec![ChangeEvent::new(AuditAction::Created, "admin", t(0))];

    let err = store
        .append(&mut writer, &AuditIdentity::new("Product", "1"), &events, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::InsertConflict { attempts: 3, .. }));
    assert_eq!(writer.inserts, 3);
}

#[tokio::test]
async fn test_append_rejects_invalid_identity() {
    let store = AuditLogStore::default();
    let mut writer = AlwaysConflicting { inserts: 0 };
    let err = store
        .append(&mut writer, &AuditIdentity::new("Product", ""), &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Identity(_)));
    assert_eq!(writer.inserts, 0);
}

// ============================================================================
// Fetch / save
// ============================================================================

#[tokio::test]
async fn test_save_replaces_a_document_that_extends_the_stored_one() {
    let h = Harness::new(DocumentFormat::Json);
    let store = AuditLogStore::new(DocumentFormat::Json, 3);
    let identity = AuditIdentity::new("Product", "42");
    let cancel = CancellationToken::new();

    let mut tx = h.storage.begin();
    assert!(store.fetch(&mut tx, &identity).await.unwrap().is_none());

    let created = AuditDocument::from_events(vec![ChangeEvent::new(AuditAction::Created, "admin", t(0))]);
    assert!(store.save(&mut tx, &identity, &created, &cancel).await.unwrap().created);

    let mut document = store.fetch(&mut tx, &identity).await.unwrap().unwrap();
    document.push(ChangeEvent::new(AuditAction::Deleted, "admin", t(1)));
    let outcome = store.save(&mut tx, &identity, &document, &cancel).await.unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.total_events, 2);

    // a document that would drop the stored history is refused
    let err = store.save(&mut tx, &identity, &created, &cancel).await.unwrap_err();
    assert!(matches!(err, AuditError::StaleDocument { stored: 2, .. }));

    tx.commit().await.unwrap();
    let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
    let actions: Vec<_> = log.events.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Created, AuditAction::Deleted]);
}

#[tokio::test]
async fn test_save_that_loses_the_insert_race_appends_after_the_winner() {
    for format in [DocumentFormat::Json, DocumentFormat::Xml] {
        let h = Harness::new(format);
        let winner = DocumentCodec::new(format)
            .merge(None, ChangeEvent::new(AuditAction::Created, "other-process", t(0)))
            .unwrap();
        let mut writer = RacingWriter {
            inner: h.storage.begin(),
            storage: h.storage.clone(),
            competitor: Some(winner),
        };

        let store = AuditLogStore::new(format, 3);
        let mine = AuditDocument::from_events(vec![ChangeEvent::new(AuditAction::Created, "admin", t(1))]);
        let outcome = store
            .save(&mut writer, &AuditIdentity::new("Product", "42"), &mine, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.lost_races, 1);
        assert_eq!(outcome.total_events, 2);
        writer.commit().await.unwrap();

        let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
        let actors: Vec<_> = log.events.iter().map(|e| e.actor.as_str()).collect();
        assert_eq!(actors, vec!["other-process", "admin"], "{format:?}");
    }
}

// ============================================================================
// Concurrent units of work
// ============================================================================

fn restocked(stock: i32) -> Product {
    Product { stock, ..laptop() }
}

#[tokio::test]
async fn test_concurrent_updates_keep_both_events() {
    let h = Harness::new(DocumentFormat::Json);
    h.commit(0, |a, buf| {
        a.entity_changed(buf, None, Some(&laptop())).unwrap();
    })
    .await;

    let first = h.auditor_at(1);
    let mut tx1 = h.storage.begin();
    let mut buf1 = AuditBuffer::new();
    first.entity_changed(&mut buf1, Some(&laptop()), Some(&restocked(2))).unwrap();
    first.flush(buf1, &mut tx1, &CancellationToken::new()).await.unwrap();

    let storage = h.storage.clone();
    let second = h.auditor_at(2);
    let racing = tokio::spawn(async move {
        let mut tx2 = storage.begin();
        let mut buf2 = AuditBuffer::new();
        second.entity_changed(&mut buf2, Some(&laptop()), Some(&restocked(3))).unwrap();
        let report = second.flush(buf2, &mut tx2, &CancellationToken::new()).await.unwrap();
        tx2.commit().await.unwrap();
        report
    });

    tx1.commit().await.unwrap();
    assert_eq!(racing.await.unwrap().created, 0);

    let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
    let stock: Vec<_> = log.events[1..]
        .iter()
        .map(|e| e.field("Stock").and_then(|f| f.after.clone()))
        .collect();
    assert_eq!(stock, vec![Some("2".to_string()), Some("3".to_string())]);
}

#[tokio::test]
async fn test_concurrent_first_writers_share_one_document() {
    for format in [DocumentFormat::Json, DocumentFormat::Xml] {
        let h = Harness::new(format);
        let first = h.auditor_at(0);
        let mut tx1 = h.storage.begin();
        let mut buf1 = AuditBuffer::new();
        first.entity_changed(&mut buf1, None, Some(&laptop())).unwrap();
        let report = first.flush(buf1, &mut tx1, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.created, 1);

        let storage = h.storage.clone();
        let second = h.auditor_at(1);
        let racing = tokio::spawn(async move {
            let mut tx2 = storage.begin();
            let mut buf2 = AuditBuffer::new();
            second
                .record(
                    &mut buf2,
                    AuditIdentity::new("Product", "42"),
                    ChangeEvent::new(AuditAction::Deleted, "importer", t(1)),
                )
                .unwrap();
            let report = second.flush(buf2, &mut tx2, &CancellationToken::new()).await.unwrap();
            tx2.commit().await.unwrap();
            report
        });

        tx1.commit().await.unwrap();
        assert_eq!(racing.await.unwrap().created, 0);

        assert_eq!(h.storage.len(), 1);
        let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
        let actions: Vec<_> = log.events.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Deleted], "{format:?}");
    }
}

#[tokio::test]
async fn test_rolled_back_first_writer_leaves_creation_to_the_next() {
    let h = Harness::new(DocumentFormat::Json);
    let first = h.auditor_at(0);
    let mut tx1 = h.storage.begin();
    let mut buf1 = AuditBuffer::new();
    first.entity_changed(&mut buf1, None, Some(&laptop())).unwrap();
    first.flush(buf1, &mut tx1, &CancellationToken::new()).await.unwrap();

    let storage = h.storage.clone();
    let second = h.auditor_at(1);
    let racing = tokio::spawn(async move {
        let mut tx2 = storage.begin();
        let mut buf2 = AuditBuffer::new();
        second.entity_changed(&mut buf2, None, Some(&laptop())).unwrap();
        let report = second.flush(buf2, &mut tx2, &CancellationToken::new()).await.unwrap();
        tx2.commit().await.unwrap();
        report
    });

    tx1.rollback().await.unwrap();
    assert_eq!(racing.await.unwrap().created, 1);

    let log = h.queries().get_log("Product", "42").await.unwrap().unwrap();
    assert_eq!(log.events.len(), 1);
    assert_eq!(log.events[0].timestamp, t(1));
}
