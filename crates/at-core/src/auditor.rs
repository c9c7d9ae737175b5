//! Auditor
//!
//! Entry point for host code. Tracked changes are turned into events and
//! buffered against the unit of work; flushing appends them to each entity's
//! document through the audit store.

use std::any::Any;
use std::sync::Arc;

use at_common::{AuditAction, AuditIdentity, ChangeEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::{AuditBuffer, PendingKey};
use crate::context::{ActorProvider, AuditContext, Clock, SystemClock};
use crate::descriptor::{RelatedDescriptor, TypeResolver};
use crate::error::{AuditError, Result};
use crate::extractor::{extract, extract_related};
use crate::lookup::{LookupResolver, ReferenceCache, ReferenceSource};
use crate::registry::AuditRegistry;
use crate::repository::AuditWriter;
use crate::store::AuditLogStore;

/// References supplied with a related change, for each snapshot
#[derive(Clone, Copy, Default)]
pub struct SuppliedReferences<'a> {
    pub before: &'a [&'a dyn Any],
    pub after: &'a [&'a dyn Any],
}

impl<'a> SuppliedReferences<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn before(before: &'a [&'a dyn Any]) -> Self {
        Self { before, after: &[] }
    }

    pub fn after(after: &'a [&'a dyn Any]) -> Self {
        Self { before: &[], after }
    }

    pub fn both(before: &'a [&'a dyn Any], after: &'a [&'a dyn Any]) -> Self {
        Self { before, after }
    }
}

/// Result of flushing a buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents written
    pub documents: usize,
    /// Events appended across all documents
    pub events: usize,
    /// Documents created by this flush
    pub created: usize,
}

pub struct Auditor {
    registry: Arc<AuditRegistry>,
    actor: Arc<dyn ActorProvider>,
    clock: Arc<dyn Clock>,
    lookups: LookupResolver,
    store: AuditLogStore,
}

impl Auditor {
    pub fn new(registry: Arc<AuditRegistry>, actor: Arc<dyn ActorProvider>, store: AuditLogStore) -> Self {
        Self {
            registry,
            actor,
            clock: Arc::new(SystemClock),
            lookups: LookupResolver::new(),
            store,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolve late-bound lookup reference types through `resolver`
    pub fn with_type_resolver(mut self, resolver: Arc<dyn TypeResolver>) -> Self {
        self.lookups = LookupResolver::with_type_resolver(resolver);
        self
    }

    pub fn registry(&self) -> &AuditRegistry {
        &self.registry
    }

    pub fn store(&self) -> &AuditLogStore {
        &self.store
    }

    /// Actor and time for events raised now
    pub fn context(&self) -> AuditContext {
        AuditContext::capture(self.actor.as_ref(), self.clock.as_ref())
    }

    /// Record a change to an audited entity
    ///
    /// Returns whether an event was buffered; an update that changed no
    /// captured property buffers nothing.
    pub fn entity_changed<T: 'static>(
        &self,
        buffer: &mut AuditBuffer,
        before: Option<&T>,
        after: Option<&T>,
    ) -> Result<bool> {
        let descriptor = self.registry.entity::<T>()?;
        let Some(event) = extract(descriptor, before, after, &self.context()) else {
            return Ok(false);
        };

        // The key of a deleted entity comes from its last known state
        let Some(instance) = after.or(before) else {
            return Ok(false);
        };
        let identity = AuditIdentity::new(descriptor.source_type(), descriptor.source_key(instance));
        identity.validate()?;
        buffer.push(identity, event);
        Ok(true)
    }

    /// Record the creation of an entity whose key is generated by the save
    pub fn entity_created_pending<T: 'static>(&self, buffer: &mut AuditBuffer, created: &T) -> Result<PendingKey> {
        let descriptor = self.registry.entity::<T>()?;
        let event = extract(descriptor, None, Some(created), &self.context()).ok_or_else(|| {
            AuditError::configuration("a creation always produces an event")
        })?;
        Ok(buffer.defer(descriptor.source_type(), event))
    }

    /// Record a change to a related entity, resolving lookups from the
    /// references the caller supplies
    pub fn related_changed<C: 'static>(
        &self,
        buffer: &mut AuditBuffer,
        before: Option<&C>,
        after: Option<&C>,
        references: SuppliedReferences<'_>,
    ) -> Result<bool> {
        let descriptor = self.registry.related::<C>()?;
        let lookups_before = before
            .map(|c| self.lookups.resolve(descriptor, c, references.before))
            .unwrap_or_default();
        let lookups_after = after
            .map(|c| self.lookups.resolve(descriptor, c, references.after))
            .unwrap_or_default();

        self.buffer_related(buffer, descriptor, before, after, &lookups_before, &lookups_after)
    }

    /// Record a change to a related entity, resolving lookups from the
    /// reference cache or `source`
    pub async fn related_changed_pull<C: Send + Sync + 'static>(
        &self,
        buffer: &mut AuditBuffer,
        before: Option<&C>,
        after: Option<&C>,
        cache: &ReferenceCache,
        source: &dyn ReferenceSource,
    ) -> Result<bool> {
        let descriptor = self.registry.related::<C>()?;
        let lookups_before = match before {
            Some(c) => self.lookups.resolve_pulled(descriptor, c, cache, source).await?,
            None => Vec::new(),
        };
        let lookups_after = match after {
            Some(c) => self.lookups.resolve_pulled(descriptor, c, cache, source).await?,
            None => Vec::new(),
        };

        self.buffer_related(buffer, descriptor, before, after, &lookups_before, &lookups_after)
    }

    fn buffer_related<C: 'static>(
        &self,
        buffer: &mut AuditBuffer,
        descriptor: &RelatedDescriptor<C>,
        before: Option<&C>,
        after: Option<&C>,
        lookups_before: &[at_common::FieldChange],
        lookups_after: &[at_common::FieldChange],
    ) -> Result<bool> {
        let Some(parent) = descriptor.parent() else {
            return Err(AuditError::UnconfiguredRelated {
                type_name: descriptor.related_type().to_string(),
            });
        };
        let Some(event) = extract_related(
            descriptor,
            before,
            after,
            lookups_before,
            lookups_after,
            &self.context(),
        ) else {
            return Ok(false);
        };

        let Some(instance) = after.or(before) else {
            return Ok(false);
        };
        let identity = AuditIdentity::new(parent.source_type.clone(), descriptor.parent_key(instance));
        identity.validate()?;
        buffer.push(identity, event);
        Ok(true)
    }

    /// Append buffered events to their documents through `writer`
    ///
    /// Events for one entity are appended together, in raise order.
    pub async fn flush<W>(&self, buffer: AuditBuffer, writer: &mut W, cancel: &CancellationToken) -> Result<FlushReport>
    where
        W: AuditWriter + ?Sized,
    {
        let groups = buffer.into_grouped()?;
        let mut report = FlushReport::default();

        for (identity, events) in groups {
            if cancel.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            let outcome = self.store.append(writer, &identity, &events, cancel).await?;
            report.documents += 1;
            report.events += events.len();
            if outcome.created {
                report.created += 1;
            }
        }

        if report.documents > 0 {
            info!(
                documents = report.documents,
                events = report.events,
                created = report.created,
                "Flushed audit events"
            );
        } else {
            debug!("No audit events to flush");
        }
        Ok(report)
    }

    /// Record events raised outside change tracking, e.g. by a data import
    ///
    /// An Updated event without fields is dropped, as for tracked changes.
    pub fn record(&self, buffer: &mut AuditBuffer, identity: AuditIdentity, event: ChangeEvent) -> Result<bool> {
        identity.validate()?;
        if event.action == AuditAction::Updated && event.fields.is_empty() {
            debug!(identity = %identity, "Dropping Updated event without field changes");
            return Ok(false);
        }
        buffer.push(identity, event);
        Ok(true)
    }
}
