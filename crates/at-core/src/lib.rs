//! AuditTrail Engine
//!
//! Captures changes to registered entity types, accumulates them into one
//! append-only document per entity, and answers queries over the stored
//! documents.
//!
//! - [`registry`] / [`descriptor`]: which types are audited and how
//! - [`extractor`] / [`lookup`]: snapshots to change events
//! - [`buffer`] / [`unit_of_work`] / [`auditor`]: buffering and flushing inside the host's transaction
//! - [`document`] / [`store`]: document encoding and the insert-race-safe writer
//! - [`query`]: read-side API
//! - [`memory`]: in-process storage

pub mod auditor;
pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod document;
pub mod error;
pub mod extractor;
pub mod lookup;
pub mod memory;
pub mod query;
pub mod registry;
pub mod repository;
pub mod store;
pub mod unit_of_work;
pub mod value;

pub use auditor::{Auditor, FlushReport, SuppliedReferences};
pub use buffer::{AuditBuffer, PendingKey};
pub use context::{ActorProvider, AuditContext, Clock, FixedClock, StaticActor, SystemClock};
pub use descriptor::{
    EntityDescriptor, LookupDescriptor, ReferenceType, RelatedDescriptor, TypeResolver,
};
pub use document::{AuditDocument, DocumentCodec, DocumentError};
pub use error::{AuditError, Result};
pub use lookup::{LookupResolver, ReferenceCache, ReferenceInstance, ReferenceSource};
pub use memory::{InMemoryAuditStorage, InMemoryTransaction};
pub use query::AuditQueryService;
pub use registry::{AuditRegistry, AuditRegistryBuilder};
pub use repository::{
    ensure_schema, AuditReader, AuditTableConfig, AuditWriter, DocumentFilter, InsertOutcome,
    SchemaManager, StoredDocument, TransactionalWriter,
};
pub use store::{AppendOutcome, AuditLogStore};
pub use unit_of_work::AuditUnitOfWork;
pub use value::{has_changed, to_canonical_string, AuditValue, ToAuditValue};

pub use at_common::{
    AuditAction, AuditIdentity, AuditLogEntry, AuditSummary, ChangeEvent, DocumentFormat,
    FieldChange,
};
